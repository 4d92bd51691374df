//! Bounded cross-worker message queues. The channel capacity plays the role
//! of the kernel pipe buffer: it is sized generously at startup and posts
//! never block the sender. On transient backpressure a post yields and
//! retries a bounded number of times before reporting failure to the caller,
//! who decides whether to drop or retry.

use tokio::sync::mpsc;
use tracing::warn;

/// Queue capacity per worker. Sized so that post failures only happen under
/// sustained overload, mirroring a pipe buffer raised to its configured cap.
pub const DEFAULT_QUEUE_DEPTH: usize = 8192;

const MAX_POST_RETRIES: usize = 4;

/// Fixed-size inter-worker datagram: an id plus two pointer-width arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: u32,
    pub arg1: usize,
    pub arg2: usize,
}

/// What travels over a worker queue: either a closure executed with the
/// receiving worker as context, or a raw datagram handed to the worker's
/// registered message handler.
pub enum WorkerRequest {
    Task(Box<dyn FnOnce(&crate::worker::Worker) + Send + 'static>),
    Message(QueueMessage),
}

pub fn channel(depth: usize) -> (MessageSender, mpsc::Receiver<WorkerRequest>) {
    let (tx, rx) = mpsc::channel(depth);
    (MessageSender { tx }, rx)
}

#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<WorkerRequest>,
}

impl MessageSender {
    /// Non-blocking post with bounded retry. Returns false when the queue is
    /// full after retrying or the worker is gone.
    pub fn post(&self, mut request: WorkerRequest) -> bool {
        for attempt in 0..=MAX_POST_RETRIES {
            match self.tx.try_send(request) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(r)) => {
                    request = r;
                    if attempt == MAX_POST_RETRIES {
                        warn!(
                            "worker queue full after {MAX_POST_RETRIES} retries; \
                             consider raising the queue depth"
                        );
                        return false;
                    }
                    std::thread::yield_now();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        false
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_receive_datagram() {
        let (tx, mut rx) = channel(4);
        assert!(tx.post(WorkerRequest::Message(QueueMessage {
            id: 7,
            arg1: 1,
            arg2: 2,
        })));
        match rx.recv().await.unwrap() {
            WorkerRequest::Message(msg) => {
                assert_eq!(msg.id, 7);
                assert_eq!((msg.arg1, msg.arg2), (1, 2));
            }
            _ => panic!("expected datagram"),
        }
    }

    #[tokio::test]
    async fn test_post_fails_after_bounded_retries() {
        let (tx, _rx) = channel(1);
        assert!(tx.post(WorkerRequest::Message(QueueMessage {
            id: 1,
            arg1: 0,
            arg2: 0,
        })));
        // queue full and nobody draining: the post must give up, not block.
        assert!(!tx.post(WorkerRequest::Message(QueueMessage {
            id: 2,
            arg1: 0,
            arg2: 0,
        })));
    }

    #[tokio::test]
    async fn test_post_to_closed_queue_fails() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert!(!tx.post(WorkerRequest::Message(QueueMessage {
            id: 1,
            arg1: 0,
            arg2: 0,
        })));
    }
}
