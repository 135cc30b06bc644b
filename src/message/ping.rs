//! `ping` / `pong` keep-alive messages (BIP 31)

use super::{read_u64_le, Message};
use bytes::{BufMut, BytesMut};

/// Liveness check carrying a random nonce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
    valid: bool,
}

/// Reply to a [`Ping`], echoing its nonce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
    valid: bool,
}

macro_rules! nonce_message {
    ($name:ident, $command:literal) => {
        impl $name {
            pub fn new(nonce: u64) -> Self {
                Self { nonce, valid: true }
            }
        }

        impl Message for $name {
            const COMMAND: &'static str = $command;

            fn from_data(&mut self, source: &mut &[u8]) -> bool {
                match read_u64_le(source) {
                    Some(nonce) => {
                        *self = Self::new(nonce);
                        true
                    }
                    None => {
                        self.reset();
                        false
                    }
                }
            }

            fn to_data(&self, sink: &mut BytesMut) {
                sink.put_u64_le(self.nonce);
            }

            fn serialized_size(&self) -> usize {
                8
            }

            fn is_valid(&self) -> bool {
                self.valid
            }

            fn reset(&mut self) {
                *self = Self::default();
            }
        }
    };
}

nonce_message!(Ping, "ping");
nonce_message!(Pong, "pong");
