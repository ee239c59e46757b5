//! Keep-alive ticker.
//!
//! Produces a PINGREQ into the outbound frame queue after a full keep-alive
//! interval of outbound idleness. The outbound pipeline resets the interval
//! on every frame it writes, so pings are only generated on a quiet
//! connection. A PINGREQ that is never answered marks the link dead on the
//! next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{trace, warn};

use crate::protocol::v4::Packet;
use crate::session::Stop;

/// Handle to the keep-alive task.
#[derive(Clone)]
pub(crate) struct Ticker {
    reset: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl Ticker {
    /// Ticker for sessions with keep-alive disabled. No task runs and
    /// [`reset`](Ticker::reset) is a no-op.
    pub(crate) fn disabled() -> Self {
        Self {
            reset: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the keep-alive task with a `keep_alive_secs` idle interval.
    pub(crate) fn start(
        keep_alive_secs: u16,
        queue: mpsc::Sender<Packet>,
        pong_pending: Arc<AtomicBool>,
        stop: Arc<Stop>,
    ) -> (Self, JoinHandle<()>) {
        let ticker = Self {
            reset: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(true)),
        };
        let handle = tokio::spawn(tick_task(
            ticker.clone(),
            Duration::from_secs(keep_alive_secs as u64),
            queue,
            pong_pending,
            stop,
        ));
        (ticker, handle)
    }

    /// Restart the idle interval from now without emitting a tick.
    pub(crate) fn reset(&self) {
        self.reset.notify_one();
    }

    /// Stop the ticker permanently.
    pub(crate) fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.reset.notify_one();
    }
}

async fn tick_task(
    ticker: Ticker,
    period: Duration,
    queue: mpsc::Sender<Packet>,
    pong_pending: Arc<AtomicBool>,
    stop: Arc<Stop>,
) {
    let mut deadline = Instant::now() + period;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                if !ticker.running.load(Ordering::SeqCst) {
                    break;
                }
                if pong_pending.swap(true, Ordering::SeqCst) {
                    warn!("no PINGRESP within keep-alive interval, stopping session");
                    stop.set();
                    break;
                }
                trace!("keep-alive interval elapsed, sending PingReq");
                if queue.send(Packet::PingReq).await.is_err() {
                    break;
                }
                deadline = Instant::now() + period;
            }
            _ = ticker.reset.notified() => {
                if !ticker.running.load(Ordering::SeqCst) {
                    break;
                }
                deadline = Instant::now() + period;
            }
        }
    }
    trace!("keep-alive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn start_test_ticker(
        keep_alive_secs: u16,
    ) -> (Ticker, mpsc::Receiver<Packet>, Arc<AtomicBool>, Arc<Stop>) {
        let (tx, rx) = mpsc::channel(8);
        let pong_pending = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Stop::default());
        let (ticker, _handle) =
            Ticker::start(keep_alive_secs, tx, Arc::clone(&pong_pending), Arc::clone(&stop));
        (ticker, rx, pong_pending, stop)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_after_idle_interval() {
        let (_ticker, mut rx, _pong, _stop) = start_test_ticker(2);

        let packet = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no tick within keep-alive interval")
            .unwrap();
        assert!(matches!(packet, Packet::PingReq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_defers_tick() {
        let (ticker, mut rx, _pong, _stop) = start_test_ticker(2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        ticker.reset();

        // The original deadline at t=2s must not fire.
        assert!(timeout(Duration::from_millis(1900), rx.recv()).await.is_err());

        // The deferred deadline at t=3s does.
        let packet = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no tick after reset interval")
            .unwrap();
        assert!(matches!(packet, Packet::PingReq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let (ticker, mut rx, _pong, _stop) = start_test_ticker(1);

        ticker.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        // Task exited and dropped its sender without ever ticking.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pingresp_stops_session() {
        let (_ticker, mut rx, pong_pending, stop) = start_test_ticker(1);

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, Packet::PingReq));
        assert!(pong_pending.load(Ordering::SeqCst));

        // Nothing answers the ping; the next tick declares the link dead.
        assert!(rx.recv().await.is_none());
        assert!(stop.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pingresp_keeps_ticking() {
        let (_ticker, mut rx, pong_pending, stop) = start_test_ticker(1);

        for _ in 0..3 {
            let packet = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert!(matches!(packet, Packet::PingReq));
            // Simulate the inbound pipeline observing PINGRESP.
            pong_pending.store(false, Ordering::SeqCst);
        }
        assert!(!stop.is_set());
    }
}
