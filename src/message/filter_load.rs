//! `filterload` message (BIP 37)
//!
//! Installs a bloom filter on the remote peer. Matching itself happens in a
//! downstream filter stage; this type only carries the parameters.

use super::{read_bytes, read_u32_le, read_u8, read_varint, varint_size, write_varint, Message};
use bytes::{BufMut, BytesMut};

/// Largest filter a peer may load, in bytes
pub const MAX_FILTER_LOAD: usize = 36_000;

/// Bloom filter load request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterLoad {
    /// Filter bit field
    pub filter: Vec<u8>,
    /// Number of hash functions applied per element
    pub hash_functions: u32,
    /// Random value added to the hash seed
    pub tweak: u32,
    /// Update behaviour on match (none / all / p2pubkey only)
    pub flags: u8,
    valid: bool,
}

impl FilterLoad {
    /// Construct a message from its fields; invalid if the filter is oversized
    pub fn new(filter: Vec<u8>, hash_functions: u32, tweak: u32, flags: u8) -> Self {
        Self {
            valid: filter.len() <= MAX_FILTER_LOAD,
            filter,
            hash_functions,
            tweak,
            flags,
        }
    }

    fn decode(source: &mut &[u8]) -> Option<Self> {
        let size = read_varint(source)?;
        if size > MAX_FILTER_LOAD as u64 {
            return None;
        }
        let filter = read_bytes(source, size as usize)?;
        let hash_functions = read_u32_le(source)?;
        let tweak = read_u32_le(source)?;
        let flags = read_u8(source)?;
        Some(Self::new(filter, hash_functions, tweak, flags))
    }
}

impl Message for FilterLoad {
    const COMMAND: &'static str = "filterload";

    fn from_data(&mut self, source: &mut &[u8]) -> bool {
        match Self::decode(source) {
            Some(message) => {
                *self = message;
                true
            }
            None => {
                self.reset();
                false
            }
        }
    }

    fn to_data(&self, sink: &mut BytesMut) {
        write_varint(sink, self.filter.len() as u64);
        sink.put_slice(&self.filter);
        sink.put_u32_le(self.hash_functions);
        sink.put_u32_le(self.tweak);
        sink.put_u8(self.flags);
    }

    fn serialized_size(&self) -> usize {
        varint_size(self.filter.len() as u64) + self.filter.len() + 4 + 4 + 1
    }

    fn is_valid(&self) -> bool {
        self.valid && self.filter.len() <= MAX_FILTER_LOAD
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
