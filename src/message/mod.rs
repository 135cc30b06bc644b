//! Wire message types
//!
//! Every message implements [`Message`]: a fixed command string, a decoder
//! that flags malformed input instead of failing, an encoder that is its
//! exact inverse, and an exact size query.
//!
//! Messages travel inside a [`Heading`] envelope, framed by
//! [`HeadingCodec`].

pub mod filter_load;
pub mod get_address;
pub mod heading;
pub mod ping;
pub mod verack;
pub mod version;

pub use filter_load::{FilterLoad, MAX_FILTER_LOAD};
pub use get_address::GetAddress;
pub use heading::{Heading, HeadingCodec, Packet, COMMAND_SIZE, HEADING_SIZE, MAX_PAYLOAD_SIZE};
pub use ping::{Ping, Pong};
pub use verack::VerAck;
pub use version::{NetworkAddress, ServiceFlags, Version, RELAY_VERSION};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Symmetric wire codec shared by all message types
pub trait Message: Default + Send + Sync + 'static {
    /// Command identifier carried in the heading
    const COMMAND: &'static str;

    /// Parse from `source`, advancing it. On malformed input the instance is
    /// reset, left invalid, and `false` is returned.
    fn from_data(&mut self, source: &mut &[u8]) -> bool;

    /// Append the encoding of this instance to `sink`
    fn to_data(&self, sink: &mut BytesMut);

    /// Exact encoded length, computed without encoding
    fn serialized_size(&self) -> usize;

    fn is_valid(&self) -> bool;

    /// Restore the default, empty state
    fn reset(&mut self);

    /// Decode a complete payload into a new instance
    fn factory_from_data(data: &[u8]) -> Self {
        let mut instance = Self::default();
        let mut source = data;
        instance.from_data(&mut source);
        instance
    }

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> Bytes {
        let mut sink = BytesMut::with_capacity(self.serialized_size());
        self.to_data(&mut sink);
        debug_assert_eq!(sink.len(), self.serialized_size());
        sink.freeze()
    }
}

// =============================================================================
// Primitive readers
// =============================================================================
//
// `bytes::Buf` getters panic on underflow, so each read checks what remains.

pub(crate) fn read_u8(source: &mut &[u8]) -> Option<u8> {
    (source.remaining() >= 1).then(|| source.get_u8())
}

pub(crate) fn read_u16_be(source: &mut &[u8]) -> Option<u16> {
    (source.remaining() >= 2).then(|| source.get_u16())
}

pub(crate) fn read_u32_le(source: &mut &[u8]) -> Option<u32> {
    (source.remaining() >= 4).then(|| source.get_u32_le())
}

pub(crate) fn read_u64_le(source: &mut &[u8]) -> Option<u64> {
    (source.remaining() >= 8).then(|| source.get_u64_le())
}

pub(crate) fn read_i64_le(source: &mut &[u8]) -> Option<i64> {
    (source.remaining() >= 8).then(|| source.get_i64_le())
}

pub(crate) fn read_bytes<'a>(source: &mut &'a [u8], len: usize) -> Option<Vec<u8>> {
    let data: &'a [u8] = *source;
    if data.len() < len {
        return None;
    }
    let (head, tail) = data.split_at(len);
    *source = tail;
    Some(head.to_vec())
}

// =============================================================================
// Variable length integers (CompactSize)
// =============================================================================

/// Read a variable length integer
pub fn read_varint(source: &mut &[u8]) -> Option<u64> {
    match read_u8(source)? {
        0xfd => (source.remaining() >= 2).then(|| source.get_u16_le() as u64),
        0xfe => read_u32_le(source).map(u64::from),
        0xff => read_u64_le(source),
        small => Some(small as u64),
    }
}

/// Write a variable length integer
pub fn write_varint(sink: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => sink.put_u8(value as u8),
        0xfd..=0xffff => {
            sink.put_u8(0xfd);
            sink.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            sink.put_u8(0xfe);
            sink.put_u32_le(value as u32);
        }
        _ => {
            sink.put_u8(0xff);
            sink.put_u64_le(value);
        }
    }
}

/// Encoded length of a variable length integer
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Read a length-prefixed string; rejects lengths above `max` and bad UTF-8
pub(crate) fn read_string(source: &mut &[u8], max: usize) -> Option<String> {
    let len = read_varint(source)?;
    if len > max as u64 {
        return None;
    }
    let bytes = read_bytes(source, len as usize)?;
    String::from_utf8(bytes).ok()
}

pub(crate) fn write_string(sink: &mut BytesMut, value: &str) {
    write_varint(sink, value.len() as u64);
    sink.put_slice(value.as_bytes());
}
