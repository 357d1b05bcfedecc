use crossbeam_channel::{Receiver, Sender, unbounded};

/// Unbounded FIFO of outbound byte buffers, one per socket direction.
///
/// Any thread may enqueue; the owning handler thread drains. Insertion order
/// is send order and buffers are never coalesced or split. Memory is not
/// bounded; backpressure is a documented non-goal of the engine.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn enqueue(&self, data: Vec<u8>) {
        // The queue holds its own receiver, so the channel can not be closed
        // underneath us.
        let _ = self.sender.send(data);
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Removes and returns everything currently queued, without blocking.
    pub fn drain_pending(&self) -> Vec<Vec<u8>> {
        self.receiver.try_iter().collect()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::OutboundQueue;

    #[test]
    fn drains_in_fifo_order() {
        let queue = OutboundQueue::new();
        queue.enqueue(b"one".to_vec());
        queue.enqueue(b"two".to_vec());
        queue.enqueue(b"three".to_vec());
        let drained = queue.drain_pending();
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_returns_nothing() {
        let queue = OutboundQueue::new();
        assert!(queue.is_empty());
        assert!(queue.drain_pending().is_empty());
    }

    #[test]
    fn accepts_producers_from_other_threads() {
        let queue = OutboundQueue::new();
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..100u8 {
                producer.enqueue(vec![i]);
            }
        });
        handle.join().expect("producer thread");
        let drained = queue.drain_pending();
        assert_eq!(drained.len(), 100);
        assert_eq!(drained[0], vec![0]);
        assert_eq!(drained[99], vec![99]);
    }
}
