//! Interval scheduler: a countdown with 1 s ticks, live duration override,
//! and early wake.
//!
//! Overrides and wakes arrive through watch channels so a signal raised
//! while the loop is mid-tick is still seen on the next select.

use chrono::Utc;
use opscenter_core::OfficeEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    ElapsedNormally,
    OverriddenFinished,
    CancelledEarly,
    Aborted,
}

impl WaitOutcome {
    pub fn reason(self) -> &'static str {
        match self {
            Self::ElapsedNormally => "elapsed",
            Self::OverriddenFinished => "overridden",
            Self::CancelledEarly => "woken",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Clone)]
pub struct IntervalScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    override_tx: watch::Sender<Option<Duration>>,
    wake_tx: watch::Sender<u64>,
    remaining_secs: AtomicU64,
    elapsed_secs: AtomicU64,
    waiting: AtomicBool,
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalScheduler {
    pub fn new() -> Self {
        let (override_tx, _) = watch::channel(None);
        let (wake_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                override_tx,
                wake_tx,
                remaining_secs: AtomicU64::new(0),
                elapsed_secs: AtomicU64::new(0),
                waiting: AtomicBool::new(false),
            }),
        }
    }

    /// Seconds left in the current rest; zero when not waiting.
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.inner.remaining_secs.load(Ordering::SeqCst))
    }

    /// Seconds already slept in the current rest.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs(self.inner.elapsed_secs.load(Ordering::SeqCst))
    }

    pub fn is_waiting(&self) -> bool {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Atomically replace the remaining duration; the in-progress tick
    /// reflects the new value on the following second.
    pub fn override_remaining(&self, remaining: Duration) {
        let _ = self.inner.override_tx.send(Some(remaining));
    }

    /// End the current wait immediately with CancelledEarly.
    pub fn wake_now(&self) {
        self.inner.wake_tx.send_modify(|n| *n += 1);
    }

    /// Count down `duration`, emitting a RestCountdownTick once per second.
    pub async fn wait_for_next(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<OfficeEvent>,
    ) -> WaitOutcome {
        let inner = &self.inner;
        let mut override_rx = inner.override_tx.subscribe();
        let mut wake_rx = inner.wake_tx.subscribe();
        // Signals from before this rest do not apply to it.
        inner.override_tx.send_replace(None);
        override_rx.borrow_and_update();
        wake_rx.borrow_and_update();

        let mut remaining = Duration::from_secs(duration.as_secs());
        let mut overridden = false;
        inner.waiting.store(true, Ordering::SeqCst);
        inner.elapsed_secs.store(0, Ordering::SeqCst);
        inner.remaining_secs.store(remaining.as_secs(), Ordering::SeqCst);
        let mut due = Utc::now() + chrono::Duration::seconds(remaining.as_secs() as i64);

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let outcome = loop {
            if remaining.is_zero() {
                break if overridden {
                    WaitOutcome::OverriddenFinished
                } else {
                    WaitOutcome::ElapsedNormally
                };
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break WaitOutcome::Aborted,
                result = wake_rx.changed() => {
                    if result.is_ok() {
                        break WaitOutcome::CancelledEarly;
                    }
                }
                result = override_rx.changed() => {
                    if result.is_ok() {
                        if let Some(new_remaining) = *override_rx.borrow_and_update() {
                            remaining = Duration::from_secs(new_remaining.as_secs());
                            overridden = true;
                            due = Utc::now()
                                + chrono::Duration::seconds(remaining.as_secs() as i64);
                            inner
                                .remaining_secs
                                .store(remaining.as_secs(), Ordering::SeqCst);
                        }
                    }
                }
                _ = ticker.tick() => {
                    remaining = remaining.saturating_sub(Duration::from_secs(1));
                    inner.remaining_secs.store(remaining.as_secs(), Ordering::SeqCst);
                    inner.elapsed_secs.fetch_add(1, Ordering::SeqCst);
                    let _ = events.send(OfficeEvent::RestCountdownTick {
                        remaining_secs: remaining.as_secs(),
                        due_ts: due,
                    });
                }
            }
        };

        inner.waiting.store(false, Ordering::SeqCst);
        inner.remaining_secs.store(0, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_values(rx: &mut mpsc::UnboundedReceiver<OfficeEvent>) -> Vec<u64> {
        let mut values = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OfficeEvent::RestCountdownTick { remaining_secs, .. } = event {
                values.push(remaining_secs);
            }
        }
        values
    }

    #[tokio::test(start_paused = true)]
    async fn counts_down_to_zero() {
        let scheduler = IntervalScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = scheduler
            .wait_for_next(Duration::from_secs(5), &CancellationToken::new(), &tx)
            .await;
        assert_eq!(outcome, WaitOutcome::ElapsedNormally);

        let ticks = tick_values(&mut rx);
        assert_eq!(ticks, vec![4, 3, 2, 1, 0]);
        assert_eq!(scheduler.remaining(), Duration::ZERO);
        assert!(!scheduler.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_elapses_immediately() {
        let scheduler = IntervalScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = scheduler
            .wait_for_next(Duration::ZERO, &CancellationToken::new(), &tx)
            .await;
        assert_eq!(outcome, WaitOutcome::ElapsedNormally);
        assert!(tick_values(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_now_returns_cancelled_early() {
        let scheduler = IntervalScheduler::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = scheduler.clone();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_next(Duration::from_secs(600), &cancel, &tx)
                .await
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.wake_now();
        let outcome = wait.await.unwrap();
        assert_eq!(outcome, WaitOutcome::CancelledEarly);
    }

    #[tokio::test(start_paused = true)]
    async fn override_extends_the_rest() {
        let scheduler = IntervalScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = scheduler.clone();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_next(Duration::from_secs(10), &cancel, &tx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        // 3 ticks in: extend to a fresh 20 s.
        scheduler.override_remaining(Duration::from_secs(20));
        let outcome = wait.await.unwrap();
        assert_eq!(outcome, WaitOutcome::OverriddenFinished);

        let ticks = tick_values(&mut rx);
        // Countdown restarts from the overridden value on the next second.
        assert!(ticks.starts_with(&[9, 8, 7]));
        assert!(ticks.contains(&19));
        assert_eq!(*ticks.last().unwrap(), 0);
        // Ticks never increase except at the override point.
        let post: Vec<_> = ticks.iter().skip_while(|v| **v != 19).collect();
        assert!(post.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn override_to_zero_finishes_on_next_pass() {
        let scheduler = IntervalScheduler::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = scheduler.clone();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_next(Duration::from_secs(600), &cancel, &tx)
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.override_remaining(Duration::ZERO);
        let outcome = wait.await.unwrap();
        assert_eq!(outcome, WaitOutcome::OverriddenFinished);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts() {
        let scheduler = IntervalScheduler::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let waiter = scheduler.clone();
        let inner_cancel = cancel.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_next(Duration::from_secs(600), &inner_cancel, &tx)
                .await
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        assert_eq!(wait.await.unwrap(), WaitOutcome::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_tracks_slept_seconds() {
        let scheduler = IntervalScheduler::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = scheduler.clone();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for_next(Duration::from_secs(300), &cancel, &tx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(60_500)).await;
        assert_eq!(scheduler.elapsed(), Duration::from_secs(60));
        assert_eq!(scheduler.remaining(), Duration::from_secs(240));

        // Live interval change: 10 min total means 9 min left after 1 min.
        scheduler.override_remaining(Duration::from_secs(600 - 60));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let remaining = scheduler.remaining();
        assert!(remaining >= Duration::from_secs(537) && remaining <= Duration::from_secs(540));

        scheduler.wake_now();
        assert_eq!(wait.await.unwrap(), WaitOutcome::CancelledEarly);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_wake_does_not_end_the_next_rest() {
        let scheduler = IntervalScheduler::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        // Wake with no wait in progress.
        scheduler.wake_now();
        let outcome = scheduler
            .wait_for_next(Duration::from_secs(3), &CancellationToken::new(), &tx)
            .await;
        assert_eq!(outcome, WaitOutcome::ElapsedNormally);
    }
}
