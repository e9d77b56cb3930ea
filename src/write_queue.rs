use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};

use crate::chunk::SocketId;
use crate::error::WriteError;

/// Where a [`WriteQueue`] puts reassembled bytes.
pub trait Destination: Write {
    /// Signals the end of the stream to the destination.
    fn close_write(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Tears the destination down after a failure.
    fn abort(&mut self) {}
}

impl Destination for TcpStream {
    fn close_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn abort(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Destination for Vec<u8> {}

/// State of a queue after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More data is expected.
    Open,
    /// The end of stream marker was flushed and the destination closed.
    Closed,
}

/// Reorder buffer for one socket.
///
/// Chunks arrive in any order; payload reaches the destination strictly in
/// sequence order. Early chunks wait in `pending` until the gap before them
/// is filled. Chunks below `expected` were already written and are ignored,
/// which makes delivery idempotent.
pub struct WriteQueue<W: Destination> {
    socket_id: SocketId,
    destination: W,
    expected: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    buffered: usize,
    max_buffered: usize,
    close_at: Option<u64>,
    closed: bool,
}

impl<W: Destination> WriteQueue<W> {
    /// Creates a queue expecting sequence 0. At most `max_buffered` payload
    /// bytes may wait behind a gap.
    pub fn new(socket_id: SocketId, destination: W, max_buffered: usize) -> WriteQueue<W> {
        WriteQueue {
            socket_id,
            destination,
            expected: 0,
            pending: BTreeMap::new(),
            buffered: 0,
            max_buffered,
            close_at: None,
            closed: false,
        }
    }

    /// Accepts the chunk at `seq`.
    pub fn write_chunk(&mut self, seq: u64, data: Vec<u8>) -> Result<Progress, WriteError> {
        if seq < self.expected {
            log::trace!("Socket {}: duplicate chunk {seq} ignored", self.socket_id);
            return Ok(self.progress());
        }
        if self.close_at.is_some_and(|fin| seq >= fin) {
            log::warn!(
                "Socket {}: chunk {seq} arrived past end of stream, dropping it",
                self.socket_id
            );
            return Ok(self.progress());
        }
        if self.closed {
            return Err(WriteError::Closed(self.socket_id.clone()));
        }
        if seq == self.expected {
            self.flush(&data)?;
            return self.drain();
        }
        if self.pending.contains_key(&seq) {
            return Ok(Progress::Open);
        }
        if self.buffered + data.len() > self.max_buffered {
            return Err(WriteError::GapOverflow {
                socket_id: self.socket_id.clone(),
                expected: self.expected,
                limit: self.max_buffered,
            });
        }
        log::trace!(
            "Socket {}: buffering chunk {seq} while waiting for {}",
            self.socket_id,
            self.expected
        );
        self.buffered += data.len();
        self.pending.insert(seq, data);
        Ok(Progress::Open)
    }

    /// Records that the stream ends right before `seq`. The destination is
    /// closed once every earlier chunk has been written.
    pub fn close_at(&mut self, seq: u64) -> Result<Progress, WriteError> {
        if self.closed {
            return Ok(Progress::Closed);
        }
        if seq < self.expected {
            log::warn!(
                "Socket {}: end of stream at {seq} but {} chunks were written",
                self.socket_id,
                self.expected
            );
        }
        self.close_at = Some(seq.max(self.expected));
        // Anything buffered beyond the end can never be written.
        let beyond = self.pending.split_off(&seq.max(self.expected));
        self.buffered -= beyond.values().map(Vec::len).sum::<usize>();
        self.drain()
    }

    /// Tears the destination down without waiting for missing chunks.
    pub fn abort(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.buffered = 0;
        self.destination.abort();
    }

    fn flush(&mut self, data: &[u8]) -> Result<(), WriteError> {
        if let Err(source) = self.destination.write_all(data) {
            self.closed = true;
            return Err(WriteError::Io {
                socket_id: self.socket_id.clone(),
                source,
            });
        }
        self.expected += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<Progress, WriteError> {
        while let Some(data) = self.pending.remove(&self.expected) {
            self.buffered -= data.len();
            self.flush(&data)?;
        }
        if self.close_at == Some(self.expected) && !self.closed {
            self.closed = true;
            self.destination
                .close_write()
                .map_err(|source| WriteError::Io {
                    socket_id: self.socket_id.clone(),
                    source,
                })?;
            log::debug!(
                "Socket {}: end of stream after {} chunks",
                self.socket_id,
                self.expected
            );
        }
        Ok(self.progress())
    }

    fn progress(&self) -> Progress {
        if self.closed {
            Progress::Closed
        } else {
            Progress::Open
        }
    }

    /// The socket this queue reassembles.
    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    /// Next sequence number to be written.
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Number of chunks waiting behind a gap.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes waiting behind a gap.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Whether the stream finished or failed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The destination written to.
    pub fn destination(&self) -> &W {
        &self.destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WriteQueue<Vec<u8>> {
        WriteQueue::new(SocketId::from("wq"), Vec::new(), 1024)
    }

    #[test]
    fn in_order_chunks_are_written_immediately() {
        let mut q = queue();
        q.write_chunk(0, b"ab".to_vec()).unwrap();
        q.write_chunk(1, b"cd".to_vec()).unwrap();
        assert_eq!(q.destination(), b"abcd");
        assert_eq!(q.expected(), 2);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn gap_is_buffered_then_drained() {
        let mut q = queue();
        q.write_chunk(2, b"2".to_vec()).unwrap();
        assert!(q.destination().is_empty());
        assert_eq!(q.pending(), 1);
        assert_eq!(q.buffered_bytes(), 1);

        q.write_chunk(0, b"0".to_vec()).unwrap();
        assert_eq!(q.destination(), b"0");

        q.write_chunk(1, b"1".to_vec()).unwrap();
        assert_eq!(q.destination(), b"012");
        assert_eq!(q.expected(), 3);
        assert_eq!(q.buffered_bytes(), 0);
    }

    #[test]
    fn duplicates_change_nothing() {
        let mut q = queue();
        q.write_chunk(1, b"b".to_vec()).unwrap();
        q.write_chunk(1, b"b".to_vec()).unwrap();
        q.write_chunk(0, b"a".to_vec()).unwrap();
        q.write_chunk(0, b"a".to_vec()).unwrap();
        q.write_chunk(1, b"b".to_vec()).unwrap();
        assert_eq!(q.destination(), b"ab");
        assert_eq!(q.expected(), 2);
    }

    #[test]
    fn any_permutation_restores_the_stream() {
        let parts: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; i as usize + 1]).collect();
        let original: Vec<u8> = parts.concat();
        let orders: [[u64; 8]; 3] = [
            [7, 6, 5, 4, 3, 2, 1, 0],
            [3, 0, 7, 1, 6, 2, 5, 4],
            [1, 3, 5, 7, 0, 2, 4, 6],
        ];
        for order in orders {
            let mut q = queue();
            for seq in order {
                q.write_chunk(seq, parts[seq as usize].clone()).unwrap();
            }
            assert_eq!(q.destination(), &original);
        }
    }

    #[test]
    fn gap_overflow_is_reported() {
        let mut q = WriteQueue::new(SocketId::from("small"), Vec::new(), 4);
        q.write_chunk(1, vec![0; 3]).unwrap();
        let err = q.write_chunk(2, vec![0; 2]).unwrap_err();
        assert!(matches!(
            err,
            WriteError::GapOverflow { expected: 0, limit: 4, .. }
        ));
    }

    #[test]
    fn close_waits_for_missing_chunks() {
        let mut q = queue();
        q.write_chunk(1, b"y".to_vec()).unwrap();
        assert_eq!(q.close_at(2).unwrap(), Progress::Open);
        assert_eq!(q.write_chunk(0, b"x".to_vec()).unwrap(), Progress::Closed);
        assert_eq!(q.destination(), b"xy");
        assert!(q.is_closed());
        // late duplicate after the end
        assert_eq!(q.write_chunk(0, b"x".to_vec()).unwrap(), Progress::Closed);
    }

    #[test]
    fn close_of_empty_stream_finishes_at_once() {
        let mut q = queue();
        assert_eq!(q.close_at(0).unwrap(), Progress::Closed);
        assert!(q.destination().is_empty());
    }

    #[test]
    fn chunk_past_the_end_is_dropped() {
        let mut q = queue();
        q.close_at(1).unwrap();
        q.write_chunk(3, b"z".to_vec()).unwrap();
        assert_eq!(q.pending(), 0);
        assert_eq!(q.write_chunk(0, b"a".to_vec()).unwrap(), Progress::Closed);
        assert_eq!(q.destination(), b"a");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Destination for Broken {}

    #[test]
    fn write_failure_surfaces_and_closes() {
        let mut q = WriteQueue::new(SocketId::from("broken"), Broken, 16);
        let err = q.write_chunk(0, b"a".to_vec()).unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }));
        assert!(q.is_closed());
        assert!(matches!(
            q.write_chunk(1, b"b".to_vec()),
            Err(WriteError::Closed(_))
        ));
    }
}
