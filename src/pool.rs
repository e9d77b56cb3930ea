use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use crate::chunk::{Message, SocketId};
use crate::error::PoolError;
use crate::link::{self, Dispatch, LinkContext};
use crate::queue::{ChunkQueue, lock};
use crate::write_queue::{Progress, WriteQueue};

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const DEFAULT_CHUNK_SIZE: usize = 8192;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;
/// Smallest reassembly buffer, in chunks.
const MIN_BUFFERED_CHUNKS: usize = 4;

/// What `submit` does when the pool has no live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Return [`PoolError::Exhausted`] right away.
    #[default]
    FailFast,
    /// Wait until a link is added or the pool shuts down.
    Block,
}

/// Settings fixed when a pool is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum payload of one chunk, also the read buffer size.
    pub chunk_size: usize,
    /// Capacity of the outgoing queue; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Behaviour when every link is gone.
    pub on_exhausted: ExhaustedPolicy,
    /// Bytes a reassembly queue may hold behind a gap.
    ///
    /// With several links, chunks routinely overtake each other, so a healthy
    /// stream keeps a few chunks per link behind the gap. A queue exceeding
    /// the bound is torn down, keep it well above `chunk_size` times the link
    /// count. At least four chunks are required.
    pub max_buffered_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            on_exhausted: ExhaustedPolicy::FailFast,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED,
        }
    }
}

impl PoolConfig {
    /// Sets the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the outgoing queue capacity.
    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the exhaustion policy.
    pub fn with_exhausted_policy(mut self, policy: ExhaustedPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    /// Sets the reassembly buffer bound.
    pub fn with_max_buffered_bytes(mut self, bytes: usize) -> Self {
        self.max_buffered_bytes = bytes;
        self
    }

    /// Checks that every size is usable.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.chunk_size == 0 {
            return Err(PoolError::InvalidConfig("chunk size must be positive"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(PoolError::InvalidConfig("chunk size exceeds the frame limit"));
        }
        if self.queue_capacity == Some(0) {
            return Err(PoolError::InvalidConfig("queue capacity must be positive"));
        }
        if self.max_buffered_bytes < self.chunk_size.saturating_mul(MIN_BUFFERED_CHUNKS) {
            return Err(PoolError::InvalidConfig(
                "reassembly buffer must hold at least four chunks",
            ));
        }
        Ok(())
    }
}

type Route = Arc<Mutex<WriteQueue<TcpStream>>>;

/// A set of links carrying chunks to one far end.
///
/// Chunks handed to [`submit`](ConnectionPool::submit) wait in a shared
/// queue. Every link runs a writer thread that takes the next chunk as soon
/// as the link is free, so the choice of link depends only on availability.
/// Order across links is irrelevant: the receiving side reorders by sequence.
///
/// The pool also keeps the reverse-route table: chunks that come back over
/// the links for a registered socket are reassembled into that socket.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    queue: ChunkQueue,
    links: Mutex<HashMap<usize, TcpStream>>,
    link_added: Condvar,
    next_link: AtomicUsize,
    routes: Mutex<HashMap<SocketId, Route>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Creates a pool without links.
    pub fn new(config: PoolConfig) -> Result<ConnectionPool, PoolError> {
        config.validate()?;
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                queue: ChunkQueue::new(config.queue_capacity),
                config,
                links: Mutex::new(HashMap::new()),
                link_added: Condvar::new(),
                next_link: AtomicUsize::new(0),
                routes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Opens `links` connections to `addr` and pools them.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        links: usize,
        config: PoolConfig,
    ) -> Result<ConnectionPool, PoolError> {
        if links == 0 {
            return Err(PoolError::InvalidConfig("a pool needs at least one link"));
        }
        let addresses: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let pool = ConnectionPool::new(config)?;
        for _ in 0..links {
            let stream = TcpStream::connect(addresses.as_slice())?;
            log::debug!("Established link to {:?}", stream.peer_addr());
            pool.add_link(stream)?;
        }
        Ok(pool)
    }

    /// Adds a link whose inbound chunks go to the reverse-route table.
    pub fn add_link(&self, stream: TcpStream) -> Result<LinkContext, PoolError> {
        let dispatch: Arc<dyn Dispatch> = self.inner.clone();
        self.add_link_with(stream, dispatch)
    }

    /// Adds a link whose inbound messages go to `dispatch`.
    pub fn add_link_with(
        &self,
        stream: TcpStream,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<LinkContext, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let _ = stream.set_nodelay(true);
        let link = LinkContext {
            id: self.inner.next_link.fetch_add(1, Ordering::Relaxed),
            peer: stream.peer_addr().ok(),
        };
        let reader = stream.try_clone()?;
        lock(&self.inner.links).insert(link.id, stream.try_clone()?);

        let writer = {
            let inner = self.inner.clone();
            let link = link.clone();
            thread::Builder::new()
                .name(format!("imux-link-{}-tx", link.id))
                .spawn(move || inner.writer_loop(&link, stream))
        };
        let receiver = writer.and_then(|_| {
            let inner = self.inner.clone();
            let link = link.clone();
            thread::Builder::new()
                .name(format!("imux-link-{}-rx", link.id))
                .spawn(move || {
                    if let Err(e) = link::receive_loop(reader, &link, dispatch.as_ref()) {
                        log::debug!("Link {} failed while receiving: {e}", link.id);
                    }
                    inner.drop_link(link.id);
                    dispatch.link_closed(&link, inner.live_links());
                })
        });
        if let Err(e) = receiver {
            self.inner.drop_link(link.id);
            return Err(e.into());
        }

        self.inner.queue.set_stalled(false);
        self.inner.link_added.notify_all();
        log::info!("Link {} to {:?} joined the pool", link.id, link.peer);
        Ok(link)
    }

    /// Queues a message for whichever link is free first.
    pub fn submit(&self, message: Message) -> Result<(), PoolError> {
        self.inner.wait_for_link()?;
        self.inner.queue.push(message)
    }

    /// Registers `socket` as the place where chunks coming back for
    /// `socket_id` are reassembled.
    pub fn chunks_back_to(&self, socket: &TcpStream, socket_id: SocketId) -> Result<(), PoolError> {
        let mut routes = lock(&self.inner.routes);
        if routes.contains_key(&socket_id) {
            return Err(PoolError::DuplicateSocket(socket_id));
        }
        let queue = WriteQueue::new(
            socket_id.clone(),
            socket.try_clone()?,
            self.inner.config.max_buffered_bytes,
        );
        routes.insert(socket_id, Arc::new(Mutex::new(queue)));
        Ok(())
    }

    /// Removes the reverse route of `socket_id`. Unknown ids are ignored.
    pub fn end(&self, socket_id: &SocketId) {
        if lock(&self.inner.routes).remove(socket_id).is_some() {
            log::debug!("Socket {socket_id} left the pool");
        }
    }

    /// Chunk size shared by every split.
    pub fn chunk_size(&self) -> usize {
        self.inner.config.chunk_size
    }

    /// The configuration the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        lock(&self.inner.links).len()
    }

    /// Number of registered reverse routes.
    pub fn route_count(&self) -> usize {
        lock(&self.inner.routes).len()
    }

    /// Messages waiting for a link.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether no link is left.
    pub fn is_degraded(&self) -> bool {
        self.link_count() == 0
    }

    /// Closes the queue, every link and every routed socket. Blocked
    /// submitters and readers wake up with an error.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.close();
        let links: Vec<_> = lock(&self.inner.links).drain().collect();
        for (_, stream) in links {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.inner.link_added.notify_all();
        let routes: Vec<_> = lock(&self.inner.routes).drain().collect();
        for (_, route) in routes {
            lock(&route).abort();
        }
        log::info!("Connection pool shut down");
    }
}

impl PoolInner {
    fn wait_for_link(&self) -> Result<(), PoolError> {
        let mut links = lock(&self.links);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }
            if !links.is_empty() {
                return Ok(());
            }
            match self.config.on_exhausted {
                ExhaustedPolicy::FailFast => return Err(PoolError::Exhausted),
                ExhaustedPolicy::Block => {
                    links = self
                        .link_added
                        .wait(links)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn writer_loop(&self, link: &LinkContext, mut stream: TcpStream) {
        while let Some(message) = self.queue.pop() {
            if !self.is_live(link.id) {
                self.queue.requeue(message);
                break;
            }
            if let Err(e) = link::write_message(&mut stream, &message) {
                log::warn!(
                    "Link {} failed to send chunk {} of socket {}: {e}",
                    link.id,
                    message.sequence_id(),
                    message.socket_id()
                );
                self.queue.requeue(message);
                break;
            }
        }
        self.drop_link(link.id);
    }

    fn is_live(&self, id: usize) -> bool {
        lock(&self.links).contains_key(&id)
    }

    fn live_links(&self) -> usize {
        lock(&self.links).len()
    }

    fn drop_link(&self, id: usize) {
        let mut links = lock(&self.links);
        let Some(stream) = links.remove(&id) else {
            return;
        };
        let _ = stream.shutdown(Shutdown::Both);
        if links.is_empty() && !self.closed.load(Ordering::Acquire) {
            log::warn!("Link {id} was the last one, the pool is degraded");
            if self.config.on_exhausted == ExhaustedPolicy::FailFast {
                self.queue.set_stalled(true);
            }
        } else {
            log::info!("Link {id} left the pool, {} remain", links.len());
        }
    }

    fn route(&self, socket_id: &SocketId) -> Option<Route> {
        lock(&self.routes).get(socket_id).cloned()
    }
}

impl Dispatch for PoolInner {
    fn dispatch(&self, message: Message, link: &LinkContext) {
        let socket_id = message.socket_id().clone();
        let Some(route) = self.route(&socket_id) else {
            log::debug!(
                "Link {}: no route for socket {socket_id}, dropping sequence {}",
                link.id,
                message.sequence_id()
            );
            return;
        };
        let mut queue = lock(&route);
        let result = match message {
            Message::Chunk(chunk) => queue.write_chunk(chunk.sequence_id, chunk.data),
            Message::Close { sequence_id, .. } => queue.close_at(sequence_id),
        };
        match result {
            Ok(Progress::Open) => {}
            Ok(Progress::Closed) => {
                log::debug!("Socket {socket_id}: return stream finished");
            }
            Err(e) => {
                log::warn!("Tearing down socket {socket_id}: {e}");
                queue.abort();
                drop(queue);
                lock(&self.routes).remove(&socket_id);
            }
        }
    }

    fn link_closed(&self, _link: &LinkContext, remaining: usize) {
        // Nothing can come back anymore, fail the routed sockets.
        if remaining > 0 || self.config.on_exhausted == ExhaustedPolicy::Block {
            return;
        }
        let routes: Vec<_> = lock(&self.routes).drain().collect();
        for (socket_id, route) in routes {
            log::warn!("Socket {socket_id}: no link left for the return path");
            lock(&route).abort();
        }
    }
}
