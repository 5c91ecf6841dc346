//! Fixtures for fast pipeline tests.

use crate::config::{PipelineConfig, StageCommand};
use crate::core::STAGE_SEQUENCE;
use crate::orchestrator::RetryPolicy;
use std::path::Path;
use std::time::Duration;

/// A configuration suitable for tests: every stage has a trivial command,
/// retry backoff is near-instant, and the watcher polls quickly.
#[must_use]
pub fn fast_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(root.join("raw"), root.join("data"))
        .with_poll_interval(Duration::from_millis(10))
        .with_retry(
            RetryPolicy::default()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5),
        );
    for stage in STAGE_SEQUENCE {
        config = config.with_command(
            stage,
            StageCommand::new("/bin/true", "out.bin").with_timeout(Duration::from_secs(5)),
        );
    }
    config
}
