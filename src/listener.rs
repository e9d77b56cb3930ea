use std::io::{ErrorKind, Result as IoResult};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use polling::{Event, Events, Poller};

const LISTENER_KEY: usize = 0;

/// A TCP listener whose accept loop can be stopped from another thread.
///
/// The listener is non-blocking and registered with a poller; `accept`
/// waits on the poller, which a [`ShutdownHandle`] can wake up.
pub struct Acceptor {
    listener: TcpListener,
    poller: Arc<Poller>,
    stopped: Arc<AtomicBool>,
}

/// Stops the accept loop of an [`Acceptor`].
#[derive(Clone)]
pub struct ShutdownHandle {
    poller: Arc<Poller>,
    stopped: Arc<AtomicBool>,
}

impl Acceptor {
    /// Creates a new `Acceptor` bound to the specified address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> IoResult<Acceptor> {
        Acceptor::new(TcpListener::bind(addr)?)
    }

    /// Wraps an already bound listener.
    pub fn new(listener: TcpListener) -> IoResult<Acceptor> {
        listener.set_nonblocking(true)?;
        let poller = Poller::new()?;
        unsafe {
            poller.add(&listener, Event::none(LISTENER_KEY))?;
        }
        Ok(Acceptor {
            listener,
            poller: Arc::new(poller),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the local address that this listener is bound to.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns a handle that stops this acceptor.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            poller: self.poller.clone(),
            stopped: self.stopped.clone(),
        }
    }

    /// Waits for the next connection. Returns `Ok(None)` once the acceptor
    /// has been shut down. The returned stream is in blocking mode.
    pub fn accept(&self) -> IoResult<Option<(TcpStream, SocketAddr)>> {
        let mut events = Events::new();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    log::debug!("Accepted connection from: {addr}");
                    return Ok(Some((stream, addr)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            events.clear();
            self.poller
                .modify(&self.listener, Event::readable(LISTENER_KEY))?;
            self.poller.wait(&mut events, None)?;
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.listener);
    }
}

impl ShutdownHandle {
    /// Makes the acceptor's current and future `accept` calls return `None`.
    pub fn shutdown(&self) -> IoResult<()> {
        self.stopped.store(true, Ordering::Release);
        self.poller.notify()
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
