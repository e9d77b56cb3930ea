use std::io::{self, ErrorKind, Read};
use std::net::TcpStream;
use std::thread;

use crate::chunk::{Chunk, Message, SocketId};
use crate::error::PoolError;
use crate::listener::Acceptor;
use crate::pool::ConnectionPool;

/// Splits a byte stream into sequenced chunks.
///
/// Every call to `next` performs one read of at most `chunk_size` bytes and
/// yields exactly one chunk with the bytes actually read. The iterator ends
/// at end of stream, or after yielding a read error.
pub struct Chunker<R> {
    reader: R,
    socket_id: SocketId,
    chunk_size: usize,
    next_sequence: u64,
    done: bool,
}

impl<R: Read> Chunker<R> {
    /// Creates a chunker starting at sequence 0.
    pub fn new(reader: R, socket_id: SocketId, chunk_size: usize) -> Chunker<R> {
        Chunker {
            reader,
            socket_id,
            chunk_size,
            next_sequence: 0,
            done: false,
        }
    }

    /// Sequence number the next chunk will carry; after the iterator ended,
    /// the number of chunks produced.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut data = vec![0u8; self.chunk_size];
        loop {
            match self.reader.read(&mut data) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    data.truncate(n);
                    let chunk = Chunk {
                        socket_id: self.socket_id.clone(),
                        sequence_id: self.next_sequence,
                        data,
                    };
                    self.next_sequence += 1;
                    return Some(Ok(chunk));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Reads `reader` until end of stream and submits every chunk to `pool`,
/// followed by the end of stream marker. Returns the number of chunks sent.
///
/// A read error ends the stream like end of file does. A pool failure stops
/// the loop at once and is returned; nothing is sent after it.
pub fn forward<R: Read>(
    reader: R,
    socket_id: &SocketId,
    pool: &ConnectionPool,
) -> Result<u64, PoolError> {
    let mut chunker = Chunker::new(reader, socket_id.clone(), pool.chunk_size());
    for chunk in &mut chunker {
        match chunk {
            Ok(chunk) => pool.submit(Message::Chunk(chunk))?,
            Err(e) => {
                log::info!("Socket {socket_id}: read failed: {e}");
                break;
            }
        }
    }
    let sent = chunker.next_sequence();
    pool.submit(Message::Close {
        socket_id: socket_id.clone(),
        sequence_id: sent,
    })?;
    Ok(sent)
}

/// Accepts connections on `listener` and inverse multiplexes each of them
/// into `destination`.
///
/// Runs until the listener fails, which is returned, or is shut down, which
/// returns `Ok(())`. Failures of a single accepted socket only end that
/// socket.
pub fn one_to_many(listener: &Acceptor, destination: &ConnectionPool) -> io::Result<()> {
    while let Some((socket, addr)) = listener.accept()? {
        let socket_id = match register(destination, &socket) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Refusing connection from {addr}: {e}");
                continue;
            }
        };
        log::info!("Socket {socket_id} opened from {addr}");

        let pool = destination.clone();
        let id = socket_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("imux-src-{socket_id}"))
            .spawn(move || read_loop(socket, id, pool));
        if let Err(e) = spawned {
            log::warn!("Cannot start read loop for socket {socket_id}: {e}");
            destination.end(&socket_id);
        }
    }
    log::info!("Listener shut down");
    Ok(())
}

fn register(pool: &ConnectionPool, socket: &TcpStream) -> Result<SocketId, PoolError> {
    loop {
        let socket_id = SocketId::generate();
        match pool.chunks_back_to(socket, socket_id.clone()) {
            Ok(()) => return Ok(socket_id),
            Err(PoolError::DuplicateSocket(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn read_loop(socket: TcpStream, socket_id: SocketId, pool: ConnectionPool) {
    match forward(&socket, &socket_id, &pool) {
        Ok(sent) => log::info!("Socket {socket_id} closed after {sent} chunks"),
        Err(e) => {
            log::warn!("Socket {socket_id} torn down: {e}");
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
    pool.end(&socket_id);
}
