use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    hello::hello_command, pool, sdam_error::check_command_reply, ConnectOptions, Connection,
    Connector, SdamError, ServerAddress,
};

/// Exponentially weighted moving average of round trip times.
#[derive(Debug, Clone)]
pub(crate) struct RttTracker {
    alpha: f64,
    average: Option<Duration>,
}

impl RttTracker {
    pub(crate) fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            average: None,
        }
    }

    pub(crate) fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            None => sample,
            Some(average) => {
                let smoothed = self.alpha * sample.as_secs_f64()
                    + (1.0 - self.alpha) * average.as_secs_f64();
                Duration::from_secs_f64(smoothed)
            }
        });
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        self.average
    }

    pub(crate) fn reset(&mut self) {
        self.average = None;
    }
}

pub(crate) type SharedRttTracker = Arc<Mutex<RttTracker>>;

pub(crate) fn add_rtt_sample(tracker: &SharedRttTracker, sample: Duration) {
    match tracker.lock() {
        Ok(mut tracker) => tracker.add_sample(sample),
        Err(poisoned) => poisoned.into_inner().add_sample(sample),
    }
}

pub(crate) fn average_rtt(tracker: &SharedRttTracker) -> Option<Duration> {
    match tracker.lock() {
        Ok(tracker) => tracker.average(),
        Err(poisoned) => poisoned.into_inner().average(),
    }
}

/// Measures round trip times on its own connection while the monitoring connection is
/// blocked in an awaitable heartbeat. The task stops when the pinger is dropped.
#[derive(Debug)]
pub(crate) struct RttPinger {
    task: JoinHandle<()>,
}

impl RttPinger {
    pub(crate) fn start(
        address: ServerAddress,
        connector: Box<dyn Connector>,
        options: ConnectOptions,
        interval: Duration,
        tracker: SharedRttTracker,
    ) -> Self {
        let span = tracing::debug_span!("RttPinger", address = %address);
        let task = tokio::spawn(
            async move {
                let mut connection: Option<Box<dyn Connection>> = None;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let started = Instant::now();
                    if connection.is_none() {
                        match pool::connect(&*connector, &address, &options).await {
                            Ok(c) => connection = Some(c),
                            Err(e) => {
                                tracing::debug!("RTT connection to `{}` failed: {}", address, e);
                                continue;
                            }
                        }
                    }
                    let Some(conn) = connection.as_mut() else {
                        continue;
                    };
                    let result = match tokio::time::timeout(
                        options.connect_timeout,
                        conn.command("admin", hello_command(false, None)),
                    )
                    .await
                    {
                        Ok(result) => result.and_then(check_command_reply),
                        Err(_) => Err(SdamError::network_timeout("RTT ping timed out")),
                    };
                    match result {
                        Ok(_) => add_rtt_sample(&tracker, started.elapsed()),
                        Err(e) => {
                            tracing::debug!("RTT ping to `{}` failed: {}", address, e);
                            if let Some(mut c) = connection.take() {
                                c.destroy(true).await;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        Self { task }
    }
}

impl Drop for RttPinger {
    fn drop(&mut self) {
        self.task.abort();
    }
}
