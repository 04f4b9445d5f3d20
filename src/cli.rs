use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dub a single video file
    Dub {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Series the episode belongs to (defaults to its directory name)
        #[arg(short, long)]
        series: Option<String>,

        /// Write the dubbed file here instead of remuxing in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Dub every video file in a directory
    Batch {
        /// Input directory (defaults to the configured scan paths)
        #[arg(short, long)]
        input_dir: Option<PathBuf>,

        /// Series for every file (defaults to each file's directory name)
        #[arg(short, long)]
        series: Option<String>,
    },

    /// Resume every unfinished episode recorded in the ledger
    Resume,

    /// Run a stuck episode again from its failed stage
    Retry {
        /// Episode id as shown by `status`
        episode: String,
    },

    /// Show the ledger state of every episode
    Status,

    /// List the voice profiles of a series
    Profiles {
        /// Series id
        series: String,
    },

    /// Parse a subtitle file and print the dialogue lines
    Parse {
        /// Subtitle file (.srt, .ass, .ssa)
        #[arg(short, long)]
        input: PathBuf,

        /// Language tag for the parsed lines
        #[arg(short, long)]
        language: Option<String>,

        /// Print every line, not just the summary
        #[arg(long)]
        lines: bool,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "animedub.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_dub_command() {
        let args = Args::try_parse_from([
            "animedub", "-v", "dub", "--input", "ep01.mkv", "--series", "frieren",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Dub { input, series, output } => {
                assert_eq!(input, PathBuf::from("ep01.mkv"));
                assert_eq!(series.as_deref(), Some("frieren"));
                assert!(output.is_none());
            }
            _ => panic!("expected dub"),
        }
    }

    #[test]
    fn test_parses_retry_and_init_config() {
        let args = Args::try_parse_from(["animedub", "retry", "00ab12cd34ef5678"]).unwrap();
        assert!(matches!(args.command, Commands::Retry { episode } if episode == "00ab12cd34ef5678"));

        let args = Args::try_parse_from(["animedub", "init-config"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::InitConfig { output, force: false } if output == PathBuf::from("animedub.toml")
        ));
    }
}
