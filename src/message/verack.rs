//! `verack` message, acknowledging a received `version`.

use super::Message;
use bytes::BytesMut;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerAck;

impl Message for VerAck {
    const COMMAND: &'static str = "verack";

    fn from_data(&mut self, _source: &mut &[u8]) -> bool {
        true
    }

    fn to_data(&self, _sink: &mut BytesMut) {}

    fn serialized_size(&self) -> usize {
        0
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn reset(&mut self) {}
}
