//! `getaddr` message
//!
//! Requests known peer addresses. Carries no payload.

use super::Message;
use bytes::BytesMut;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAddress;

impl Message for GetAddress {
    const COMMAND: &'static str = "getaddr";

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
