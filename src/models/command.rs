use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ModelCommandConfig, ModelsConfig};
use crate::error::{DubError, Result};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[a-z_]+\}").expect("valid placeholder pattern"));

/// Lines of stderr kept in error messages
const STDERR_TAIL_LINES: usize = 20;

/// Values substituted into `{name}` placeholders of a command line
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<&'static str, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn with_path(self, key: &'static str, path: &Path) -> Self {
        self.with(key, path.to_string_lossy().into_owned())
    }

    pub fn with_opt_path(self, key: &'static str, path: Option<&Path>) -> Self {
        match path {
            Some(p) => self.with_path(key, p),
            None => self,
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// External model runtime invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct ModelCommand {
    name: String,
    program: String,
    args: Vec<String>,
    interruptible: bool,
    timeout: Duration,
    device: String,
    model_dir: PathBuf,
}

impl ModelCommand {
    pub fn from_config(name: &str, command: &ModelCommandConfig, models: &ModelsConfig) -> Self {
        Self {
            name: name.to_string(),
            program: command.program.clone(),
            args: command.args.clone(),
            interruptible: command.interruptible,
            timeout: Duration::from_secs(command.timeout_secs),
            device: models.device.clone(),
            model_dir: models.model_dir.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    /// Substitute placeholders. An argument left with an unresolved
    /// placeholder is dropped, along with the `-flag` right before it.
    pub fn render_args(&self, placeholders: &Placeholders) -> Vec<String> {
        let placeholders = placeholders
            .clone()
            .with("device", self.device.clone())
            .with_path("model_dir", &self.model_dir);

        let mut rendered: Vec<String> = Vec::with_capacity(self.args.len());
        let mut last_was_flag = false;

        for arg in &self.args {
            let mut value = arg.clone();
            for (key, replacement) in &placeholders.values {
                value = value.replace(&format!("{{{}}}", key), replacement);
            }

            if PLACEHOLDER_RE.is_match(&value) {
                if last_was_flag {
                    rendered.pop();
                }
                last_was_flag = false;
                continue;
            }

            last_was_flag = value.starts_with('-') && value.len() > 1;
            rendered.push(value);
        }

        rendered
    }

    /// Run to completion. Cancellation kills the process only when the
    /// runtime is marked interruptible; otherwise the call finishes first.
    pub async fn run(&self, placeholders: &Placeholders, cancel: &CancellationToken) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(DubError::Cancelled(format!("{} not started", self.name)));
        }

        let args = self.render_args(placeholders);
        debug!("Running {}: {} {}", self.name, self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DubError::Model(format!("Failed to start {} ({}): {}", self.name, self.program, e)))?;

        let wait = child.wait_with_output();
        let output = if self.interruptible {
            tokio::select! {
                out = wait => out?,
                _ = cancel.cancelled() => {
                    return Err(DubError::Cancelled(format!("{} interrupted", self.name)));
                }
                _ = tokio::time::sleep(self.timeout) => {
                    return Err(DubError::Model(format!("{} timed out after {:?}", self.name, self.timeout)));
                }
            }
        } else {
            tokio::select! {
                out = wait => out?,
                _ = tokio::time::sleep(self.timeout) => {
                    return Err(DubError::Model(format!("{} timed out after {:?}", self.name, self.timeout)));
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(classify_failure(&self.name, &stderr));
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Out-of-memory is a resource problem worth retrying after backoff;
/// anything else is the model's fault.
pub fn classify_failure(name: &str, stderr: &str) -> DubError {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

    if stderr.to_lowercase().contains("out of memory") {
        DubError::Resource(format!("{} ran out of memory: {}", name, tail))
    } else {
        DubError::Model(format!("{} failed: {}", name, tail))
    }
}

/// Read a JSON result the runtime wrote to `path`, falling back to stdout.
pub async fn read_json_output<T: serde::de::DeserializeOwned>(
    name: &str,
    path: &Path,
    output: &CommandOutput,
) -> Result<T> {
    let content = if path.exists() {
        tokio::fs::read_to_string(path).await?
    } else {
        output.stdout.clone()
    };

    serde_json::from_str(&content)
        .map_err(|e| DubError::Model(format!("Failed to parse {} output: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str], interruptible: bool) -> ModelCommand {
        let models = ModelsConfig::default();
        let config = ModelCommandConfig {
            program: "sh".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            interruptible,
            timeout_secs: 30,
        };
        ModelCommand::from_config("test", &config, &models)
    }

    #[test]
    fn test_render_substitutes_and_drops_missing() {
        let cmd = command(
            &["--device", "{device}", "--text-file", "{text_file}", "--reference", "{reference}", "{output}"],
            false,
        );
        let args = cmd.render_args(
            &Placeholders::new()
                .with("text_file", "/tmp/line.txt")
                .with("output", "/tmp/out.wav"),
        );
        assert_eq!(args, vec!["--device", "cuda", "--text-file", "/tmp/line.txt", "/tmp/out.wav"]);
    }

    #[test]
    fn test_render_keeps_positional_before_missing() {
        let cmd = command(&["{input}", "{reference}", "-o", "{output_dir}"], false);
        let args = cmd.render_args(&Placeholders::new().with("input", "a.wav").with("output_dir", "out"));
        assert_eq!(args, vec!["a.wav", "-o", "out"]);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("x", "RuntimeError: CUDA out of memory. Tried to allocate"),
            DubError::Resource(_)
        ));
        assert!(matches!(classify_failure("x", "ValueError"), DubError::Model(_)));
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let cmd = command(&["-c", "echo {input}"], false);
        let out = cmd
            .run(&Placeholders::new().with("input", "hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure_is_model_error() {
        let cmd = command(&["-c", "echo boom >&2; exit 3"], false);
        let err = cmd.run(&Placeholders::new(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DubError::Model(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_interruptible_command_is_cancelled() {
        let cmd = command(&["-c", "sleep 10"], true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = cmd.run(&Placeholders::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, DubError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_non_interruptible_command_finishes() {
        let cmd = command(&["-c", "sleep 0.2; echo done"], false);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out = cmd.run(&Placeholders::new(), &cancel).await.unwrap();
        assert_eq!(out.stdout.trim(), "done");
    }
}
