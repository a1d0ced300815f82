//! In-memory channel pair backing one slot.
//!
//! A `Channel` owns both of its ends, so either side of a session can clone it
//! and the slot registry can tell whether unread messages are left behind.
//! Worker transports (in-process tasks, process pipes) attach to the same pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::protocol::{SlotRequest, SlotResponse};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// Unbounded FIFO channel with a pending-message count.
pub struct Channel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn send(&self, msg: T) -> Result<(), ChannelError> {
        // Count before sending so a fast receiver never sees the counter underflow.
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(msg).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Wait for the next message. Cancel safe.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let msg = rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(msg)
    }

    /// Take the next message if one is queued and no other reader is active.
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        let msg = rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(msg)
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if both handles refer to the same underlying queue.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pending, &other.pending)
    }
}

/// The duplex pair of one slot: requests flow router -> worker, responses back.
#[derive(Clone, Default)]
pub struct SlotChannels {
    pub requests: Channel<SlotRequest>,
    pub responses: Channel<SlotResponse>,
}

impl SlotChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Residual messages left by a previous session, if any.
    pub fn residue(&self) -> Option<(usize, usize)> {
        let (requests, responses) = (self.requests.len(), self.responses.len());
        (requests > 0 || responses > 0).then_some((requests, responses))
    }

    pub fn is_dirty(&self) -> bool {
        self.residue().is_some()
    }

    pub fn same_pair(&self, other: &Self) -> bool {
        self.requests.same_channel(&other.requests) && self.responses.same_channel(&other.responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn messages_are_fifo_and_counted() {
        let channel = Channel::<u32>::new();
        channel.send(1).unwrap();
        channel.send(2).unwrap();
        assert_eq!(channel.len(), 2);

        assert_eq!(channel.recv().await, Some(1));
        assert_eq!(channel.try_recv(), Some(2));
        assert!(channel.is_empty());
        assert_eq!(channel.try_recv(), None);
    }

    #[tokio::test]
    async fn clones_share_the_queue() {
        let channel = Channel::<&'static str>::new();
        let other = channel.clone();
        other.send("hello").unwrap();

        assert!(channel.same_channel(&other));
        assert_eq!(channel.recv().await, Some("hello"));
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn recv_wakes_on_later_send() {
        let channel = Channel::<u32>::new();
        let sender = channel.clone();
        let waiter = tokio::spawn(async move { channel.recv().await });
        tokio::task::yield_now().await;
        sender.send(7).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[test]
    fn residue_reports_both_directions() {
        let channels = SlotChannels::new();
        assert!(!channels.is_dirty());

        channels.requests.send(SlotRequest::Close).unwrap();
        channels
            .responses
            .send(SlotResponse::Finish { payload: json!(1) })
            .unwrap();
        channels
            .responses
            .send(SlotResponse::Finish { payload: json!(2) })
            .unwrap();

        assert_eq!(channels.residue(), Some((1, 2)));
        assert!(!channels.same_pair(&SlotChannels::new()));
        assert!(channels.same_pair(&channels.clone()));
    }
}
