//! FIFO of compressed packets for one elementary stream.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::source::CompressedPacket;

/// A thread-safe FIFO of demuxed packets awaiting decode.
///
/// The queue itself enforces no bound; backpressure comes from the reader
/// thread checking [`len`](Self::len) against its target occupancy before
/// reading more packets from the demuxer.
pub struct PacketQueue {
    packets: Mutex<VecDeque<CompressedPacket>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a packet at the tail.
    pub fn push(&self, packet: CompressedPacket) {
        self.packets.lock().push_back(packet);
    }

    /// Removes and returns the head packet, or `None` if the queue is
    /// empty. Non-blocking; callers poll.
    pub fn pop(&self) -> Option<CompressedPacket> {
        self.packets.lock().pop_front()
    }

    /// Drops every queued packet, releasing the backing memory. Safe to
    /// call while a producer is still running; a straggler only ever sees
    /// an empty queue afterwards.
    pub fn flush(&self) {
        let mut packets = self.packets.lock();
        let dropped = packets.len();
        packets.clear();
        if dropped > 0 {
            log::debug!("flushed {} queued packets", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamKind;

    fn packet(tag: u8) -> CompressedPacket {
        CompressedPacket {
            kind: StreamKind::Video,
            data: vec![tag],
            pts: None,
            dts: None,
            keyframe: false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new();
        for tag in 0..10 {
            queue.push(packet(tag));
        }
        for tag in 0..10 {
            let popped = queue.pop().expect("queue should not be empty");
            assert_eq!(popped.data[0], tag);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_len_tracks_push_and_pop() {
        let queue = PacketQueue::new();
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());

        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.len(), 2);

        queue.pop();
        assert_eq!(queue.len(), 1);
        queue.pop();
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_empties_queue() {
        let queue = PacketQueue::new();
        for tag in 0..5 {
            queue.push(packet(tag));
        }
        queue.flush();
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_flush_is_idempotent() {
        let queue = PacketQueue::new();
        queue.flush();
        assert_eq!(queue.len(), 0);

        queue.push(packet(7));
        queue.flush();
        queue.flush();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_concurrent_push_pop() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(PacketQueue::new());
        let count = 1000usize;

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..count {
                    queue.push(packet((i % 256) as u8));
                    if i % 64 == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut popped = 0usize;
                let mut last = None::<u8>;
                while popped < count {
                    match queue.pop() {
                        Some(pkt) => {
                            // Tags cycle 0..=255; order within the cycle must hold
                            if let Some(prev) = last {
                                assert_eq!(pkt.data[0], prev.wrapping_add(1));
                            }
                            last = Some(pkt.data[0]);
                            popped += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(queue.is_empty());
    }
}
