//! A drift-compensating periodic caller.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Runs a callback on a fixed period without overlap.
///
/// Invocations never overlap because the loop awaits the callback before
/// arming the next deadline. The next deadline advances from the previous one
/// rather than from "now", so callback duration does not stretch the period;
/// when a callback overruns a whole period the missed fires coalesce into one
/// and the schedule rebases. [`Ticker::reset`] pushes the next fire a full
/// period away, which a caller uses when some other action already did the
/// periodic work.
///
/// Used for the presence heartbeat: one fire per period, reset after every
/// explicit upsert.
#[derive(Debug)]
pub struct Ticker {
    reset: mpsc::Sender<()>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawns a ticker invoking `callback` every `period`, first fire one
    /// full period from now. Dropping the returned handle stops it.
    #[must_use]
    pub fn spawn<C, F>(period: Duration, mut callback: C) -> Self
    where
        C: FnMut() -> F + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let (reset_sender, mut reset_receiver) = mpsc::channel::<()>(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut deadline = Instant::now() + period;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = reset_receiver.recv() => {
                        if received.is_none() {
                            break;
                        }
                        trace!("deferring next fire");
                        deadline = Instant::now() + period;
                    }
                    () = sleep_until(deadline) => {
                        callback().await;
                        deadline += period;
                        let now = Instant::now();
                        if deadline <= now {
                            // The callback overran the period: fire once for
                            // the backlog and pick the schedule back up from
                            // here.
                            deadline = now + period;
                        }
                    }
                }
            }
        });

        Self {
            reset: reset_sender,
            cancel,
            task: Some(task),
        }
    }

    /// Pushes the next fire to one full period from now. A reset that is
    /// already queued covers this one too.
    pub fn reset(&self) {
        self.reset.try_send(()).ok();
    }

    /// Stops the ticker and waits for any in-flight callback to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    const PERIOD: Duration = Duration::from_millis(100);

    fn counting_ticker() -> (Ticker, Arc<AtomicUsize>) {
        let fires = Arc::new(AtomicUsize::new(0));
        let seen = fires.clone();
        let ticker = Ticker::spawn(PERIOD, move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (ticker, fires)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_period() {
        let (ticker, fires) = counting_ticker();

        for _ in 0..3 {
            advance(PERIOD).await;
        }

        assert_eq!(fires.load(Ordering::SeqCst), 3);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_before_the_first_period() {
        let (ticker, fires) = counting_ticker();

        advance(PERIOD - Duration::from_millis(1)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 0);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callbacks_never_overlap() {
        let starts = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let ticker = {
            let starts = starts.clone();
            let running = running.clone();
            let overlapped = overlapped.clone();
            Ticker::spawn(PERIOD, move || {
                let starts = starts.clone();
                let running = running.clone();
                let overlapped = overlapped.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    // Two and a half periods of work per fire.
                    sleep(Duration::from_millis(250)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            })
        };

        // Runs start at t=100, 450, 800, and 1150.
        for _ in 0..28 {
            advance(Duration::from_millis(50)).await;
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(starts.load(Ordering::SeqCst), 4);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_defers_the_next_fire() {
        let (ticker, fires) = counting_ticker();

        advance(Duration::from_millis(50)).await;
        ticker.reset();
        tokio::task::yield_now().await;

        // The original deadline at t=100 must not fire.
        advance(Duration::from_millis(60)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);

        // The deferred deadline at t=150 does.
        advance(Duration::from_millis(40)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fires() {
        let (ticker, fires) = counting_ticker();

        advance(PERIOD).await;
        ticker.stop().await;
        advance(PERIOD * 5).await;

        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_task() {
        let (ticker, fires) = counting_ticker();

        drop(ticker);
        advance(PERIOD * 3).await;

        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }
}
