use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use crate::chunk::{Message, SocketId};
use crate::error::WriteError;
use crate::queue::lock;
use crate::write_queue::{Destination, Progress, WriteQueue};

/// How many retired socket ids are remembered.
const RETIRED_MEMORY: usize = 4096;

/// Result of handing a message to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message was written or buffered.
    Accepted,
    /// The message completed the stream; the queue was retired.
    Finished,
    /// The socket was already retired; the message was dropped.
    Stale,
}

enum Slot<W: Destination> {
    Pending,
    Open(WriteQueue<W>),
    Retired,
}

struct Inner<W: Destination> {
    queues: HashMap<SocketId, Arc<Mutex<Slot<W>>>>,
    retired: HashSet<SocketId>,
    retired_order: VecDeque<SocketId>,
}

/// The set of write queues of one egress instance.
///
/// Lookup-or-insert happens under a single short lock; each queue has its
/// own lock so that chunks of one socket are applied one at a time while
/// different sockets proceed in parallel. A queue lock may be held while
/// taking the registry lock, never the other way around.
pub struct WriteQueueRegistry<W: Destination> {
    inner: Mutex<Inner<W>>,
    max_buffered: usize,
}

impl<W: Destination> WriteQueueRegistry<W> {
    /// Creates an empty registry whose queues buffer at most `max_buffered`
    /// bytes each.
    pub fn new(max_buffered: usize) -> WriteQueueRegistry<W> {
        WriteQueueRegistry {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                retired: HashSet::new(),
                retired_order: VecDeque::new(),
            }),
            max_buffered,
        }
    }

    /// Applies `message` to the queue of its socket. The first message of a
    /// socket opens the queue, calling `open` for its destination.
    pub fn deliver<F>(&self, message: Message, open: F) -> Result<Delivery, WriteError>
    where
        F: FnOnce(&SocketId) -> io::Result<W>,
    {
        let socket_id = message.socket_id().clone();
        let Some(slot) = self.slot(&socket_id) else {
            return Ok(Delivery::Stale);
        };
        let mut slot = lock(&slot);
        if let Slot::Pending = *slot {
            match open(&socket_id) {
                Ok(destination) => {
                    log::debug!("Opened write queue for socket {socket_id}");
                    *slot = Slot::Open(WriteQueue::new(
                        socket_id.clone(),
                        destination,
                        self.max_buffered,
                    ));
                }
                Err(source) => {
                    *slot = Slot::Retired;
                    self.forget(&socket_id);
                    return Err(WriteError::Open { socket_id, source });
                }
            }
        }
        let Slot::Open(queue) = &mut *slot else {
            return Ok(Delivery::Stale);
        };
        let result = match message {
            Message::Chunk(chunk) => queue.write_chunk(chunk.sequence_id, chunk.data),
            Message::Close { sequence_id, .. } => queue.close_at(sequence_id),
        };
        match result {
            Ok(Progress::Open) => Ok(Delivery::Accepted),
            Ok(Progress::Closed) => {
                *slot = Slot::Retired;
                self.forget(&socket_id);
                Ok(Delivery::Finished)
            }
            Err(e) => {
                queue.abort();
                *slot = Slot::Retired;
                self.forget(&socket_id);
                Err(e)
            }
        }
    }

    /// Retires the queue of `socket_id`, aborting its destination. Safe to
    /// call for unknown or already retired ids.
    pub fn retire(&self, socket_id: &SocketId) {
        let slot = lock(&self.inner).queues.get(socket_id).cloned();
        self.forget(socket_id);
        if let Some(slot) = slot {
            let mut slot = lock(&slot);
            if let Slot::Open(queue) = &mut *slot {
                queue.abort();
            }
            *slot = Slot::Retired;
        }
    }

    /// Retires every queue. Later messages for those sockets are stale.
    pub fn retire_all(&self) {
        let slots: Vec<_> = lock(&self.inner).queues.drain().collect();
        for (socket_id, slot) in slots {
            self.forget(&socket_id);
            let mut slot = lock(&slot);
            if let Slot::Open(queue) = &mut *slot {
                queue.abort();
            }
            *slot = Slot::Retired;
        }
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        lock(&self.inner).queues.len()
    }

    /// Whether no queue is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `socket_id` has a live queue.
    pub fn contains(&self, socket_id: &SocketId) -> bool {
        lock(&self.inner).queues.contains_key(socket_id)
    }

    fn slot(&self, socket_id: &SocketId) -> Option<Arc<Mutex<Slot<W>>>> {
        let mut inner = lock(&self.inner);
        if inner.retired.contains(socket_id) {
            return None;
        }
        let slot = inner
            .queues
            .entry(socket_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::Pending)));
        Some(slot.clone())
    }

    fn forget(&self, socket_id: &SocketId) {
        let mut inner = lock(&self.inner);
        inner.queues.remove(socket_id);
        if inner.retired.insert(socket_id.clone()) {
            inner.retired_order.push_back(socket_id.clone());
        }
        while inner.retired_order.len() > RETIRED_MEMORY {
            if let Some(oldest) = inner.retired_order.pop_front() {
                inner.retired.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use std::thread;

    fn chunk(id: &str, seq: u64, data: &[u8]) -> Message {
        Message::Chunk(Chunk {
            socket_id: SocketId::from(id),
            sequence_id: seq,
            data: data.to_vec(),
        })
    }

    fn close(id: &str, seq: u64) -> Message {
        Message::Close {
            socket_id: SocketId::from(id),
            sequence_id: seq,
        }
    }

    #[test]
    fn opens_once_per_socket() {
        let registry = WriteQueueRegistry::<Vec<u8>>::new(1024);
        let mut opened = 0;
        for seq in [1, 0, 2] {
            registry
                .deliver(chunk("a", seq, b"x"), |_| {
                    opened += 1;
                    Ok(Vec::new())
                })
                .unwrap();
        }
        assert_eq!(opened, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&SocketId::from("a")));
    }

    #[test]
    fn concurrent_sockets_get_exactly_one_queue_each() {
        const SOCKETS: usize = 64;
        const CHUNKS: u64 = 16;
        let registry = WriteQueueRegistry::<Vec<u8>>::new(1 << 20);

        thread::scope(|s| {
            for worker in 0..8u64 {
                let registry = &registry;
                s.spawn(move || {
                    for seq in (0..CHUNKS).filter(|seq| seq % 8 == worker) {
                        for socket in 0..SOCKETS {
                            let id = format!("socket-{socket}");
                            registry
                                .deliver(chunk(&id, seq, &[seq as u8]), |_| Ok(Vec::new()))
                                .unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(registry.len(), SOCKETS);
    }

    #[test]
    fn finished_stream_ignores_late_duplicates() {
        let registry = WriteQueueRegistry::<Vec<u8>>::new(1024);
        let open = |_: &SocketId| Ok(Vec::new());
        registry.deliver(chunk("a", 0, b"x"), open).unwrap();
        assert_eq!(
            registry.deliver(close("a", 1), open).unwrap(),
            Delivery::Finished
        );
        assert!(registry.is_empty());

        let reopened = registry
            .deliver(chunk("a", 0, b"x"), |_| panic!("reopened a finished socket"))
            .unwrap();
        assert_eq!(reopened, Delivery::Stale);
        assert!(registry.is_empty());
    }

    #[test]
    fn open_failure_is_reported_and_retired() {
        let registry = WriteQueueRegistry::<Vec<u8>>::new(1024);
        let err = registry
            .deliver(chunk("a", 0, b"x"), |_| {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"))
            })
            .unwrap_err();
        assert!(matches!(err, WriteError::Open { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn gap_overflow_retires_the_queue() {
        let registry = WriteQueueRegistry::<Vec<u8>>::new(2);
        let open = |_: &SocketId| Ok(Vec::new());
        registry.deliver(chunk("a", 1, b"xx"), open).unwrap();
        assert!(registry.deliver(chunk("a", 2, b"y"), open).is_err());
        assert!(!registry.contains(&SocketId::from("a")));
    }

    #[test]
    fn retire_is_idempotent() {
        let registry = WriteQueueRegistry::<Vec<u8>>::new(1024);
        registry.retire(&SocketId::from("never-seen"));
        registry
            .deliver(chunk("a", 0, b"x"), |_| Ok(Vec::new()))
            .unwrap();
        registry.retire(&SocketId::from("a"));
        registry.retire(&SocketId::from("a"));
        assert!(registry.is_empty());
    }
}
