//! Portal-facing services: authentication and profile selection, case
//! resolution, document downloads, panel directory queries, and the batch
//! processing orchestrator that ties them together.

pub mod auth;
pub mod directory;
pub mod download;
pub mod processor;
pub mod resolution;

pub use auth::AuthService;
pub use directory::DirectoryService;
pub use download::DownloadService;
pub use processor::{CaseDirectory, CaseResolver, DownloadApi, Processor, RunOptions};
pub use resolution::{ResolutionService, ResolveStrategy};

use pje_core::EngineConfig;
use rand::Rng;
use std::time::Duration;

/// Jittered inter-request delay in milliseconds, within the configured band.
pub(crate) fn jitter_ms(config: &EngineConfig) -> u64 {
    let min = config.request_delay_min_ms.min(config.request_delay_max_ms);
    let max = config.request_delay_min_ms.max(config.request_delay_max_ms);
    rand::thread_rng().gen_range(min..=max)
}

/// Short pause between chatty page interactions, outside the main pipeline
/// pacing. Jittered so request trains don't look mechanical.
pub(crate) async fn pace_short() {
    let ms = rand::thread_rng().gen_range(300..=700);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let config = EngineConfig::default();
        for _ in 0..50 {
            let ms = jitter_ms(&config);
            assert!(ms >= config.request_delay_min_ms);
            assert!(ms <= config.request_delay_max_ms);
        }
    }

    #[test]
    fn jitter_tolerates_inverted_band() {
        let config = EngineConfig {
            request_delay_min_ms: 900,
            request_delay_max_ms: 100,
            ..EngineConfig::default()
        };
        let ms = jitter_ms(&config);
        assert!((100..=900).contains(&ms));
    }
}
