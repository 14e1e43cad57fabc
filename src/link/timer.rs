use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{LinkEvent, ReconnectTimer};

/// Reconnect timer backed by one sleeping tokio task per arm
///
/// A fire is delivered as [`LinkEvent::RetryTimerFired`] on the event
/// channel. Re-arming or cancelling aborts the sleeping task, and the ticket
/// check in [`ReconnectTimer::acknowledge`] drops any fire that was already
/// queued when that happened.
pub struct TokioRetryTimer {
    events: mpsc::Sender<LinkEvent>,
    task: Option<JoinHandle<()>>,
    armed: Option<u64>,
    next_ticket: u64,
}

impl TokioRetryTimer {
    pub fn new(events: mpsc::Sender<LinkEvent>) -> Self {
        TokioRetryTimer {
            events,
            task: None,
            armed: None,
            next_ticket: 0,
        }
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl ReconnectTimer for TokioRetryTimer {
    fn arm(&mut self, delay: Duration) -> u64 {
        self.abort_task();

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.armed = Some(ticket);

        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = events.send(LinkEvent::RetryTimerFired { ticket }).await {
                error!("Failed to deliver retry timer fire: {}", e);
            }
        }));

        debug!("Retry timer armed (ticket {}, {:?})", ticket, delay);
        ticket
    }

    fn cancel(&mut self) {
        if let Some(ticket) = self.armed.take() {
            debug!("Retry timer cancelled (ticket {})", ticket);
        }
        self.abort_task();
    }

    fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    fn acknowledge(&mut self, ticket: u64) -> bool {
        if self.armed == Some(ticket) {
            self.armed = None;
            self.task = None;
            true
        } else {
            debug!("Ignoring stale retry timer fire (ticket {})", ticket);
            false
        }
    }
}

impl Drop for TokioRetryTimer {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = TokioRetryTimer::new(tx);

        let ticket = timer.arm(Duration::from_millis(10));
        assert!(timer.is_armed());

        match rx.recv().await {
            Some(LinkEvent::RetryTimerFired { ticket: fired }) => assert_eq!(fired, ticket),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(timer.acknowledge(ticket));
        assert!(!timer.is_armed());
        assert!(!timer.acknowledge(ticket));
    }

    #[tokio::test]
    async fn rearming_replaces_pending_fire() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = TokioRetryTimer::new(tx);

        let first = timer.arm(Duration::from_millis(50));
        let second = timer.arm(Duration::from_millis(10));
        assert_ne!(first, second);

        match rx.recv().await {
            Some(LinkEvent::RetryTimerFired { ticket }) => assert_eq!(ticket, second),
            other => panic!("unexpected event: {:?}", other),
        }

        // the first task was aborted and never fires
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = TokioRetryTimer::new(tx);

        let ticket = timer.arm(Duration::from_millis(10));
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.acknowledge(ticket));
    }
}
