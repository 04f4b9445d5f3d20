//! animedub - Automated anime dubbing
//!
//! Turns a Japanese-audio anime episode with subtitles into a dubbed one:
//! the dialogue track is separated, speakers are identified and matched
//! against per-series voice profiles, each subtitle line is re-voiced with a
//! cloned voice and the result is mixed back over the accompaniment and
//! remuxed. Every episode moves through a resumable stage ledger.

pub mod alignment;
pub mod assembler;
pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod media;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod profiles;
pub mod scheduler;
pub mod subtitle;
pub mod workflow;
