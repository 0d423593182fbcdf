use std::future::Future;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

/// A recurring unit of work, typically one source adapter.
///
/// The scheduler owns the job and awaits each run before the next tick, so a
/// run never overlaps with another run of the same job. Ticks missed while a
/// run is in flight are skipped, not queued.
pub trait PollJob: Send + 'static {
    fn run(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Adapter turning an async closure into a [`PollJob`].
pub struct FnJob<F>(pub F);

impl<F, Fut> PollJob for FnJob<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn run(&mut self) -> impl Future<Output = Result<()>> + Send {
        (self.0)()
    }
}

pub struct PollScheduler {
    cancel_token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start polling `job` every `interval`, first run immediately.
    ///
    /// A zero interval means the source is disabled: no task is spawned and
    /// `false` is returned.
    pub fn schedule<J: PollJob>(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        job: J,
    ) -> bool {
        let name = name.into();
        if interval.is_zero() {
            log_info!("[{name}] polling disabled (interval 0)");
            return false;
        }

        log_info!("[{name}] polling every {}s", interval.as_secs());
        let handle = tokio::spawn(poll_loop(
            name.clone(),
            interval,
            job,
            self.cancel_token.child_token(),
        ));
        self.handles.push((name, handle));
        true
    }

    pub fn scheduled(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Stop every loop. In-flight runs finish first. Every loop is joined
    /// even when an earlier one panicked.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();
        let mut failed = Vec::new();
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                log_error!("[{name}] poll loop failed to join: {err}");
                failed.push(name);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("poll loops failed to join: {}", failed.join(", ")))
        }
    }
}

async fn poll_loop<J: PollJob>(
    name: String,
    interval: Duration,
    mut job: J,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let started = Instant::now();
                match job.run().await {
                    Ok(()) => log_debug!("[{name}] poll finished in {}ms", started.elapsed().as_millis()),
                    Err(err) => log_error!("[{name}] poll failed after {}ms: {err:#}", started.elapsed().as_millis()),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("[{name}] poll loop shutting down");
                break;
            }
        }
    }
}
