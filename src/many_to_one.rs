use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use crate::chunk::{Message, SocketId};
use crate::error::{PoolError, WriteError};
use crate::link::{Dispatch, LinkContext};
use crate::listener::Acceptor;
use crate::one_to_many::forward;
use crate::pool::{ConnectionPool, ExhaustedPolicy, PoolConfig};
use crate::registry::{Delivery, WriteQueueRegistry};

/// Egress side: accepts links, reassembles every socket's chunks and writes
/// them to a fresh connection to the destination.
///
/// The first chunk of an unknown socket opens a destination connection.
/// Whatever the destination sends back is split again and returned over the
/// accepted links.
#[derive(Clone)]
pub struct ManyToOne {
    egress: Arc<Egress>,
}

struct Egress {
    destination: Vec<SocketAddr>,
    registry: Arc<WriteQueueRegistry<TcpStream>>,
    pool: ConnectionPool,
}

impl ManyToOne {
    /// Creates an egress writing to `destination`, which is resolved once.
    pub fn new<A: ToSocketAddrs>(destination: A, config: PoolConfig) -> Result<ManyToOne, PoolError> {
        let destination: Vec<SocketAddr> = destination.to_socket_addrs()?.collect();
        if destination.is_empty() {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination resolved to no address",
            )));
        }
        let registry = Arc::new(WriteQueueRegistry::new(config.max_buffered_bytes));
        let pool = ConnectionPool::new(config)?;
        Ok(ManyToOne {
            egress: Arc::new(Egress {
                destination,
                registry,
                pool,
            }),
        })
    }

    /// Accepts links until the listener fails or is shut down.
    pub fn serve(&self, listener: &Acceptor) -> io::Result<()> {
        while let Some((stream, addr)) = listener.accept()? {
            let dispatch: Arc<dyn Dispatch> = self.egress.clone();
            match self.egress.pool.add_link_with(stream, dispatch) {
                Ok(link) => log::info!("Link {} accepted from {addr}", link.id),
                Err(e) => log::warn!("Cannot use link from {addr}: {e}"),
            }
        }
        log::info!("Link listener shut down");
        Ok(())
    }

    /// The write queues of this instance.
    pub fn registry(&self) -> &WriteQueueRegistry<TcpStream> {
        &self.egress.registry
    }

    /// The pool of accepted links, used for the return path.
    pub fn pool(&self) -> &ConnectionPool {
        &self.egress.pool
    }

    /// Closes every link and destination connection.
    pub fn shutdown(&self) {
        self.egress.pool.shutdown();
        self.egress.registry.retire_all();
    }
}

impl Egress {
    fn open_destination(&self, socket_id: &SocketId) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.destination.as_slice())?;
        let reader = stream.try_clone()?;
        let registry = self.registry.clone();
        let pool = self.pool.clone();
        let id = socket_id.clone();
        thread::Builder::new()
            .name(format!("imux-dst-{socket_id}"))
            .spawn(move || match forward(&reader, &id, &pool) {
                Ok(sent) => log::debug!("Socket {id}: destination sent {sent} chunks back"),
                Err(e) => {
                    log::warn!("Socket {id}: return path failed: {e}");
                    registry.retire(&id);
                }
            })?;
        log::info!("Socket {socket_id} connected to {:?}", stream.peer_addr());
        Ok(stream)
    }
}

impl Dispatch for Egress {
    fn dispatch(&self, message: Message, link: &LinkContext) {
        let socket_id = message.socket_id().clone();
        let sequence = message.sequence_id();
        match self
            .registry
            .deliver(message, |id| self.open_destination(id))
        {
            Ok(Delivery::Accepted) => {
                log::trace!("Link {}: socket {socket_id} sequence {sequence}", link.id)
            }
            Ok(Delivery::Finished) => log::info!("Socket {socket_id} finished"),
            Ok(Delivery::Stale) => {
                log::debug!("Link {}: stale sequence {sequence} for socket {socket_id}", link.id)
            }
            Err(e @ WriteError::Open { .. }) => log::warn!("{e}"),
            Err(e) => log::warn!("Socket {socket_id} dropped: {e}"),
        }
    }

    fn link_closed(&self, link: &LinkContext, remaining: usize) {
        if remaining > 0 || self.pool.config().on_exhausted == ExhaustedPolicy::Block {
            return;
        }
        // The missing chunks of every open socket were in flight on the dead
        // links.
        if !self.registry.is_empty() {
            log::warn!(
                "Link {} was the last one, dropping {} unfinished sockets",
                link.id,
                self.registry.len()
            );
        }
        self.registry.retire_all();
    }
}

/// Serves links on `listener`, writing every reassembled socket to
/// `destination`.
pub fn many_to_one<A: ToSocketAddrs>(
    listener: &Acceptor,
    destination: A,
    config: PoolConfig,
) -> io::Result<()> {
    ManyToOne::new(destination, config)?.serve(listener)
}
