//! Message heading and stream framing
//!
//! Wire layout (24 bytes, then payload):
//! `[u32 LE magic][12-byte NUL padded command][u32 LE length][4-byte checksum]`
//! where the checksum is the first four bytes of SHA-256d(payload).

use crate::error::NetworkError;
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the command field
pub const COMMAND_SIZE: usize = 12;

/// Size of an encoded heading
pub const HEADING_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;

/// Largest payload accepted from a peer (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub magic: u32,
    pub command: String,
    pub payload_size: u32,
    pub checksum: u32,
}

impl Heading {
    /// Heading for `payload` sent under `command`
    pub fn new(magic: u32, command: &str, payload: &[u8]) -> Self {
        Self {
            magic,
            command: command.to_string(),
            payload_size: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    /// Parse a heading from exactly `HEADING_SIZE` bytes
    pub fn from_data(mut data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < HEADING_SIZE {
            return Err(NetworkError::MalformedMessage("short heading".to_string()));
        }

        let magic = data.get_u32_le();
        let command = parse_command(&data[..COMMAND_SIZE])?;
        data.advance(COMMAND_SIZE);
        let payload_size = data.get_u32_le();
        let checksum = data.get_u32_le();

        Ok(Self {
            magic,
            command,
            payload_size,
            checksum,
        })
    }

    pub fn to_data(&self, sink: &mut BytesMut) {
        let mut command = [0u8; COMMAND_SIZE];
        let len = self.command.len().min(COMMAND_SIZE);
        command[..len].copy_from_slice(&self.command.as_bytes()[..len]);

        sink.put_u32_le(self.magic);
        sink.put_slice(&command);
        sink.put_u32_le(self.payload_size);
        sink.put_u32_le(self.checksum);
    }
}

/// First four bytes of the double SHA-256 of `payload`, little-endian
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = Sha256::digest(Sha256::digest(payload));
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

fn parse_command(raw: &[u8]) -> Result<String, NetworkError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);

    if name.is_empty()
        || !name.iter().all(|b| b.is_ascii_graphic())
        || padding.iter().any(|&b| b != 0)
    {
        return Err(NetworkError::MalformedMessage(format!(
            "invalid command {}",
            hex::encode(raw)
        )));
    }

    Ok(String::from_utf8_lossy(name).into_owned())
}

// =============================================================================
// Packet framing
// =============================================================================

/// A command and its raw payload, as moved through the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: String,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(command: impl Into<String>, payload: Bytes) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    /// Serialize a typed message into a packet
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self::new(M::COMMAND, message.to_bytes())
    }
}

/// Length-prefixed framing codec for [`Packet`]s
#[derive(Debug, Clone)]
pub struct HeadingCodec {
    magic: u32,
    /// Heading of a frame whose payload is still arriving
    pending: Option<Heading>,
}

impl HeadingCodec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            pending: None,
        }
    }
}

impl Encoder<Packet> for HeadingCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.command.len() > COMMAND_SIZE {
            return Err(NetworkError::MalformedMessage(format!(
                "command too long: {}",
                item.command
            )));
        }
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::MalformedMessage(format!(
                "payload too large: {} bytes",
                item.payload.len()
            )));
        }

        let heading = Heading::new(self.magic, &item.command, &item.payload);
        dst.reserve(HEADING_SIZE + item.payload.len());
        heading.to_data(dst);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for HeadingCodec {
    type Item = Packet;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let heading = match self.pending.take() {
            Some(heading) => heading,
            None => {
                // Need at least a full heading
                if src.len() < HEADING_SIZE {
                    return Ok(None);
                }

                let heading = Heading::from_data(&src[..HEADING_SIZE])?;
                if heading.magic != self.magic {
                    return Err(NetworkError::MalformedMessage(format!(
                        "invalid magic {:#010x}",
                        heading.magic
                    )));
                }
                if heading.payload_size as usize > MAX_PAYLOAD_SIZE {
                    return Err(NetworkError::MalformedMessage(format!(
                        "payload too large: {} bytes",
                        heading.payload_size
                    )));
                }

                src.advance(HEADING_SIZE);
                heading
            }
        };

        let size = heading.payload_size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            self.pending = Some(heading);
            return Ok(None);
        }

        let payload = src.split_to(size).freeze();
        if checksum(&payload) != heading.checksum {
            return Err(NetworkError::MalformedMessage(format!(
                "checksum mismatch on {}",
                heading.command
            )));
        }

        log::trace!(
            "Decoded {} ({} bytes): {}",
            heading.command,
            size,
            hex::encode(&payload[..size.min(64)])
        );

        Ok(Some(Packet::new(heading.command, payload)))
    }
}
