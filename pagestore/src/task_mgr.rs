//! This module contains the runtime and helpers for the pool's background
//! tasks (currently only the shard sweepers).
//!
//! Caller-facing operations are synchronous; background work runs on one
//! dedicated multi-threaded tokio runtime shared by every buffer manager
//! incarnation of the process. The runtime is never torn down: teardown
//! cancels the tasks, not the threads.

use std::time::Duration;

use once_cell::sync::Lazy;
use strum_macros::IntoStaticStr;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT;

pub static BACKGROUND_RUNTIME_WORKER_THREADS: Lazy<usize> = Lazy::new(|| {
    // Sweeper rounds are short and lock-light; one worker per core is
    // already generous.
    std::cmp::max(1, num_cpus::get())
});

pub static BACKGROUND_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("background op worker")
        .worker_threads(*BACKGROUND_RUNTIME_WORKER_THREADS)
        .enable_time()
        .build()
        .expect("Failed to create background op runtime")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum TaskKind {
    Sweeper,
}

impl TaskKind {
    pub(crate) fn as_static_str(self) -> &'static str {
        self.into()
    }
}

#[derive(thiserror::Error, Debug)]
#[error("cancelled")]
pub(crate) struct Cancelled;

/// Provide a random delay for background task initialization.
///
/// This delay prevents a thundering herd of sweepers all waking on the same
/// tick and will likely keep them running on different phases for more
/// stable load.
pub(crate) async fn random_init_delay(
    period: Duration,
    cancel: &CancellationToken,
) -> Result<(), Cancelled> {
    use rand::Rng;

    if period == Duration::ZERO {
        return Ok(());
    }

    let d = {
        let mut rng = rand::thread_rng();
        rng.gen_range(Duration::ZERO..=period)
    };

    match tokio::time::timeout(d, cancel.cancelled()).await {
        Ok(_) => Err(Cancelled),
        Err(_) => Ok(()),
    }
}

pub(crate) fn warn_when_period_overrun(elapsed: Duration, period: Duration, task: TaskKind) {
    if elapsed >= period && period != Duration::ZERO {
        info!(
            ?elapsed,
            period = %humantime::format_duration(period),
            ?task,
            "task iteration took longer than the configured period"
        );
        BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT
            .with_label_values(&[task.as_static_str()])
            .inc();
    }
}
