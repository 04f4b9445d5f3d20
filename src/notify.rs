// Media-server refresh trigger, fired after an episode is finalized.
//
// Notification is best effort: callers log failures and move on.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::NotifierConfig;
use crate::error::{DubError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaServerNotifier: Send + Sync {
    /// Tell the media server that `output` changed
    async fn notify(&self, episode_id: &str, output: &Path) -> Result<()>;
}

/// POSTs `{episode_id, path}` to the configured endpoint
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    token_header: String,
    token: Option<String>,
}

impl HttpNotifier {
    pub fn new(url: String, config: &NotifierConfig) -> Result<Self> {
        reqwest::Url::parse(&url)
            .map_err(|e| DubError::Config(format!("Invalid notifier url '{}': {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            url,
            token_header: config.token_header.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl MediaServerNotifier for HttpNotifier {
    async fn notify(&self, episode_id: &str, output: &Path) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "episode_id": episode_id,
            "path": output.display().to_string(),
        }));
        if let Some(token) = &self.token {
            request = request.header(self.token_header.as_str(), token.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::Model(format!("Media server refresh failed {}: {}", status, body)));
        }

        debug!("Media server notified for episode {}", episode_id);
        Ok(())
    }
}

pub struct NoopNotifier;

#[async_trait]
impl MediaServerNotifier for NoopNotifier {
    async fn notify(&self, episode_id: &str, _output: &Path) -> Result<()> {
        debug!("No media server configured; skipping refresh for {}", episode_id);
        Ok(())
    }
}

pub struct NotifierFactory;

impl NotifierFactory {
    pub fn create_from_config(config: &NotifierConfig) -> Result<Arc<dyn MediaServerNotifier>> {
        match config.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Ok(Arc::new(HttpNotifier::new(url.to_string(), config)?)),
            None => Ok(Arc::new(NoopNotifier)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_noop_notifier_succeeds() {
        let notifier = NotifierFactory::create_from_config(&NotifierConfig::default()).unwrap();
        assert_ok!(notifier.notify("ep", Path::new("/tmp/x.mkv")).await);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = NotifierConfig::default();
        let result = HttpNotifier::new("not a url".to_string(), &config);
        assert!(matches!(result, Err(DubError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let config = NotifierConfig {
            url: Some("http://127.0.0.1:9/refresh".to_string()),
            timeout_secs: 1,
            ..NotifierConfig::default()
        };
        let notifier = NotifierFactory::create_from_config(&config).unwrap();
        assert_err!(notifier.notify("ep", Path::new("/tmp/x.mkv")).await);
    }
}
