use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Leaky token pacer for rate-limited probe targets.
///
/// Emits an immediate burst of `x - 1` leases, then refills up to `x` leases
/// per period. A consumer that falls behind loses leases instead of building
/// a queue, so a stalled probe never gets to hammer an API to catch up.
#[derive(Debug)]
pub struct Throttle {
    leases: mpsc::Receiver<Instant>,
    stop: Option<oneshot::Sender<()>>,
}

impl Throttle {
    /// Panics if `x` is zero or `period` is zero.
    pub fn new(x: usize, period: Duration) -> Self {
        assert!(x >= 1, "throttle burst must be at least 1");
        assert!(!period.is_zero(), "throttle period must be non-zero");

        let (tx, rx) = mpsc::channel(x);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        tokio::spawn(async move {
            let now = Instant::now();
            for _ in 0..x - 1 {
                if tx.try_send(now).is_err() {
                    break;
                }
            }

            let mut ticker = time::interval_at(now + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    tick = ticker.tick() => {
                        for _ in 0..x {
                            // drop leases the consumer has no room for
                            if tx.try_send(tick).is_err() {
                                break;
                            }
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Throttle {
            leases: rx,
            stop: Some(stop_tx),
        }
    }

    /// Receives the next lease. Returns `None` once the throttle is stopped
    /// and all buffered leases are drained.
    pub async fn recv(&mut self) -> Option<Instant> {
        self.leases.recv().await
    }

    /// Stops the throttle, closing its channel. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn emits_initial_burst() {
        let mut throttle = Throttle::new(3, Duration::from_millis(100));
        tokio::task::yield_now().await;

        assert!(throttle.recv().await.is_some());
        assert!(throttle.recv().await.is_some());
        // the third lease only arrives with the first tick
        assert!(throttle.leases.try_recv().is_err());

        time::advance(Duration::from_millis(110)).await;
        assert!(throttle.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_never_accumulates_leases() {
        let mut throttle = Throttle::new(3, Duration::from_millis(100));
        tokio::task::yield_now().await;

        // consumer sleeps for a second while ten periods elapse
        time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let mut queued = 0;
        while throttle.leases.try_recv().is_ok() {
            queued += 1;
        }
        assert!(queued <= 3, "observed {queued} queued leases");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_channel() {
        let mut throttle = Throttle::new(1, Duration::from_millis(50));
        tokio::task::yield_now().await;

        throttle.stop();
        // stopping twice is fine
        throttle.stop();
        tokio::task::yield_now().await;

        assert_eq!(throttle.recv().await, None);
    }

    #[test]
    #[should_panic]
    fn zero_period_panics() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let _ = Throttle::new(1, Duration::ZERO);
    }
}
