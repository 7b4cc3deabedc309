//! Periodic tick tasks for the controller.
//!
//! Each timer owns a bounded(1) tick channel filled with `try_send`: a tick
//! that fires while the previous one is still being processed is coalesced
//! instead of queued, so tick handlers never overlap or pile up.

use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

/// One timer tick. Carries nothing; the receiving loop knows which timer it
/// subscribed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick;

pub struct PeriodicTask {
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a timer thread emitting a `Tick` every `interval`.
    pub fn spawn(name: &str, interval: Duration) -> (Self, Receiver<Tick>) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (tick_tx, tick_rx) = bounded::<Tick>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            // coalesce when the consumer is still busy
                            let _ = tick_tx.try_send(Tick);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("spawn timer thread");
        (
            Self {
                stop_tx,
                handle: Some(handle),
            },
            tick_rx,
        )
    }

    pub fn cancel(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Deliver `msg` to `tx` after `delay`, from a detached thread.
///
/// Used for the safe-handover wait-out: the deferred broadcast lands on the
/// controller's own message channel and is applied in order with everything
/// else. Send errors are ignored, the receiver may be gone by then.
pub fn send_after<M: Send + 'static>(delay: Duration, tx: Sender<M>, msg: M) {
    thread::spawn(move || {
        thread::sleep(delay);
        let _ = tx.send(msg);
    });
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn emits_ticks_at_roughly_the_interval() {
        let (_task, rx) = PeriodicTask::spawn("test-timer", Duration::from_millis(5));
        let start = Instant::now();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).expect("tick");
        }
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn slow_consumers_see_coalesced_ticks() {
        let (_task, rx) = PeriodicTask::spawn("test-timer", Duration::from_millis(2));
        // let several intervals elapse without consuming
        thread::sleep(Duration::from_millis(30));
        rx.recv_timeout(Duration::from_secs(1)).expect("tick");
        // at most one more tick can be buffered afterwards
        let mut buffered = 0;
        while rx.try_recv().is_ok() {
            buffered += 1;
        }
        assert!(buffered <= 1, "ticks piled up: {buffered}");
    }

    #[test]
    fn cancel_stops_the_timer() {
        let (mut task, rx) = PeriodicTask::spawn("test-timer", Duration::from_millis(2));
        task.cancel();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_delivers_once() {
        let (tx, rx) = bounded(1);
        let start = Instant::now();
        send_after(Duration::from_millis(10), tx, 42u32);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("msg"), 42);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
