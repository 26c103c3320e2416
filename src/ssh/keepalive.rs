// ABOUTME: Periodic protocol-level liveness probing for an open connection.
// ABOUTME: One task per connection; stops on the first failed probe or on explicit cancellation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Something that can be asked whether the far end is still there.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn probe(&self) -> Result<(), russh::Error>;
}

#[async_trait]
impl<H> LivenessProbe for russh::client::Handle<H>
where
    H: russh::client::Handler + 'static,
{
    async fn probe(&self) -> Result<(), russh::Error> {
        if self.is_closed() {
            return Err(russh::Error::Disconnect);
        }
        self.send_keepalive(true).await
    }
}

/// Observable result of keepalive probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No probe has been sent yet.
    NeverProbed,
    /// Every probe so far went out.
    Healthy { probes: u64 },
    /// A probe could not be sent; the connection should be considered dead.
    Failed { probes: u64, failures: u64 },
}

/// Counters shared between a connection and its keepalive task.
#[derive(Debug)]
pub struct ConnectionHealth {
    probes: AtomicU64,
    failures: AtomicU64,
    alive: AtomicBool,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            probes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }
}

impl ConnectionHealth {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> HealthStatus {
        let probes = self.probes.load(Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            HealthStatus::Failed { probes, failures }
        } else if probes == 0 {
            HealthStatus::NeverProbed
        } else {
            HealthStatus::Healthy { probes }
        }
    }

    fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Handle owning the keepalive task. Dropping it aborts the task.
#[derive(Debug)]
pub struct KeepaliveHandle {
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    health: Arc<ConnectionHealth>,
}

impl KeepaliveHandle {
    pub fn health(&self) -> &Arc<ConnectionHealth> {
        &self.health
    }

    /// Whether the task has exited, either by cancellation or a failed probe.
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        // Take the handle out before awaiting so the lock is not held.
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };
        match task.await {
            Err(e) if !e.is_cancelled() => {
                tracing::debug!(error = %e, "keepalive task ended abnormally");
            }
            _ => {}
        }
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Shortest probe period; shorter requests are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Start probing every `period`. The first probe goes out one full period after start.
pub fn spawn<P: LivenessProbe>(probe: Arc<P>, period: Duration) -> KeepaliveHandle {
    if period < MIN_PERIOD {
        tracing::warn!(requested = ?period, used = ?MIN_PERIOD, "keepalive period too short, raising it");
    }
    let period = period.max(MIN_PERIOD);
    let shutdown = Arc::new(Notify::new());
    let health = Arc::new(ConnectionHealth::default());

    let first_tick = Instant::now() + period;
    let task = tokio::spawn(run(
        probe,
        first_tick,
        period,
        Arc::clone(&shutdown),
        Arc::clone(&health),
    ));

    KeepaliveHandle {
        shutdown,
        task: Mutex::new(Some(task)),
        health,
    }
}

async fn run<P: LivenessProbe>(
    probe: Arc<P>,
    first_tick: Instant,
    period: Duration,
    shutdown: Arc<Notify>,
    health: Arc<ConnectionHealth>,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::trace!("keepalive cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        health.record_probe();
        if let Err(e) = probe.probe().await {
            // The next real operation on the connection will report the failure.
            tracing::debug!(error = %e, "keepalive probe failed, stopping");
            health.record_failure();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeProbe {
        calls: AtomicUsize,
        closed: AtomicBool,
    }

    impl FakeProbe {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LivenessProbe for FakeProbe {
        async fn probe(&self) -> Result<(), russh::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                Err(russh::Error::Disconnect)
            } else {
                Ok(())
            }
        }
    }

    const PERIOD: Duration = Duration::from_secs(60);

    /// Let the spawned task observe the advanced clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_probe_per_tick() {
        let probe = Arc::new(FakeProbe::default());
        let handle = spawn(Arc::clone(&probe), PERIOD);

        settle().await;
        assert_eq!(probe.calls(), 0);
        assert_eq!(handle.health().status(), HealthStatus::NeverProbed);

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(probe.calls(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(probe.calls(), 1);

        tokio::time::advance(PERIOD).await;
        settle().await;
        tokio::time::advance(PERIOD).await;
        settle().await;
        assert_eq!(probe.calls(), 3);
        assert_eq!(handle.health().status(), HealthStatus::Healthy { probes: 3 });
        assert!(handle.health().is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_stops_silently() {
        let probe = Arc::new(FakeProbe::default());
        probe.closed.store(true, Ordering::SeqCst);
        let handle = spawn(Arc::clone(&probe), PERIOD);

        tokio::time::advance(PERIOD).await;
        settle().await;
        assert_eq!(probe.calls(), 1);
        assert!(handle.is_finished());
        assert!(!handle.health().is_alive());
        assert_eq!(
            handle.health().status(),
            HealthStatus::Failed {
                probes: 1,
                failures: 1
            }
        );

        // No further probes after the failure.
        tokio::time::advance(PERIOD * 5).await;
        settle().await;
        assert_eq!(probe.calls(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_before_first_probe() {
        let probe = Arc::new(FakeProbe::default());
        let handle = spawn(Arc::clone(&probe), PERIOD);

        handle.stop().await;
        assert!(handle.is_finished());

        tokio::time::advance(PERIOD * 3).await;
        settle().await;
        assert_eq!(probe.calls(), 0);
        assert_eq!(handle.health().status(), HealthStatus::NeverProbed);
        assert!(handle.health().is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_probes_at_minimum_period() {
        let probe = Arc::new(FakeProbe::default());
        let handle = spawn(Arc::clone(&probe), Duration::ZERO);

        settle().await;
        assert_eq!(probe.calls(), 0);

        tokio::time::advance(MIN_PERIOD).await;
        settle().await;
        assert_eq!(probe.calls(), 1);
        assert!(handle.health().is_alive());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn drop_aborts_task() {
        let probe = Arc::new(FakeProbe::default());
        let handle = spawn(Arc::clone(&probe), PERIOD);
        drop(handle);

        tokio::time::advance(PERIOD * 2).await;
        settle().await;
        assert_eq!(probe.calls(), 0);
    }
}
