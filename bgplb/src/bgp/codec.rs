use std::io::{Error, ErrorKind};

use bgp_rs::{Message, Reader};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// Marker (16) + length (2) + type (1).
const HEADER_LENGTH: usize = 19;
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Frames BGP messages on the peer stream, using bgp-rs for the actual
/// message encoding.
#[derive(Debug, Default)]
pub(super) struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]) as usize;
        if !(HEADER_LENGTH..=MAX_MESSAGE_LENGTH).contains(&length) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad BGP message length {length}"),
            ));
        }
        if buf.len() < length {
            return Ok(None);
        }
        let mut reader = Reader::new(&buf[..length]);
        let (_header, message) = reader.read()?;
        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        message.encode(&mut buf.writer())
    }
}
