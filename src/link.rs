//! Framing of [`Message`]s over a link and typed dispatch of what arrives.
//!
//! Every frame is a little endian `u32` payload length followed by the
//! bincode record of one message.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bincode::error::DecodeError;

use crate::chunk::{self, Message};

/// Largest payload a frame may announce.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Opaque context handed to the dispatcher with every message of a link.
#[derive(Debug, Clone)]
pub struct LinkContext {
    /// Pool-local identifier of the link.
    pub id: usize,
    /// Remote end of the link, when known.
    pub peer: Option<SocketAddr>,
}

/// Receives every message decoded from a link.
pub trait Dispatch: Send + Sync {
    /// Handles one message that arrived on `link`.
    fn dispatch(&self, message: Message, link: &LinkContext);

    /// Called once `link` stopped receiving, with the number of links the
    /// pool still holds.
    fn link_closed(&self, _link: &LinkContext, _remaining: usize) {}
}

/// One frame read from a link.
#[derive(Debug)]
pub enum Frame {
    /// A well formed message.
    Message(Message),
    /// A frame whose payload does not decode. Framing is intact, so the link
    /// can keep going.
    Malformed(DecodeError),
}

/// Writes `message` as a single frame.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> io::Result<()> {
    let payload =
        chunk::encode(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        ));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Reads the next frame. Returns `Ok(None)` when the link closed between
/// frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut len_bs = [0u8; 4];
    match reader.read_exact(&mut len_bs) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bs) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(match chunk::decode(&payload) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Malformed(e),
    }))
}

/// Reads frames from `reader` until the link closes, handing every message to
/// `dispatch`. Malformed frames are dropped with a warning.
pub fn receive_loop<R: Read>(
    mut reader: R,
    link: &LinkContext,
    dispatch: &dyn Dispatch,
) -> io::Result<()> {
    loop {
        match read_frame(&mut reader)? {
            None => {
                log::debug!("Link {} closed by peer", link.id);
                return Ok(());
            }
            Some(Frame::Message(message)) => dispatch.dispatch(message, link),
            Some(Frame::Malformed(e)) => {
                log::warn!("Dropping malformed frame on link {}: {e}", link.id);
            }
        }
    }
}
