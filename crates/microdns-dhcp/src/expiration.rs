//! ExpirationTimer (§4.4): periodically sweeps a lease store for leases past
//! `ends`, flips them to `expired`, and triggers a full lease-file rewrite.
//! The `tokio::time::sleep` + `Notify` race stands in for the source's
//! condvar-timed wait; a `watch` channel carries the shutdown signal, the
//! same primitive the donor uses for its own server shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;

pub struct ExpirationTimer {
    notify: Arc<Notify>,
}

impl ExpirationTimer {
    /// Spawns the sweep task. `expire_old` is called on every wakeup and
    /// must return the number of leases it flipped to expired; when that
    /// count is nonzero, `on_expired` is invoked (the caller wires this to
    /// `AsyncIoQueue::save_all`).
    pub fn spawn<F, G>(
        check_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
        mut expire_old: F,
        mut on_expired: G,
    ) -> Self
    where
        F: FnMut() -> usize + Send + 'static,
        G: FnMut() + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let notify_task = notify.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(check_interval) => {}
                    _ = notify_task.notified() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }

                let flipped = expire_old();
                if flipped > 0 {
                    debug!(flipped, "expired leases, scheduling full rewrite");
                    on_expired();
                }
            }
        });

        ExpirationTimer { notify }
    }

    /// Forces an immediate sweep rather than waiting for the next interval.
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn wakeup_triggers_sweep_before_interval() {
        let (tx, rx) = watch::channel(false);
        let sweeps = Arc::new(AtomicUsize::new(0));
        let sweeps_task = sweeps.clone();

        let timer = ExpirationTimer::spawn(
            Duration::from_secs(3600),
            rx,
            move || {
                sweeps_task.fetch_add(1, Ordering::SeqCst);
                0
            },
            || {},
        );

        timer.wakeup();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 1);

        let _ = tx.send(true);
    }
}
