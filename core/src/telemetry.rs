use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consume_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters of one consumption session, returned in its report.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub fetches: usize,
    pub empty_fetches: usize,
    pub messages: usize,
    pub bytes: u64,
    pub segments_built: usize,
    pub segments_published: usize,
    pub segments_discarded: usize,
    pub segment_failures: usize,
    pub checkpoints_accepted: usize,
    pub checkpoints_superseded: usize,
    pub checkpoint_failures: usize,
    pub transient_errors: usize,
    pub fetch_overruns: usize,
}
