//! `version` message
//!
//! First message on every channel; announces protocol level, services and
//! chain height. Negotiation logic lives with the session manager, the
//! channel only stores the peer's copy (see `Channel::set_version`).

use super::{
    read_bytes, read_i64_le, read_string, read_u16_be, read_u32_le, read_u64_le, read_u8,
    varint_size, write_string, Message,
};
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// First protocol level that carries the `relay` byte (BIP 37)
pub const RELAY_VERSION: u32 = 70_001;

/// Longest accepted user agent
pub const MAX_USER_AGENT: usize = 256;

/// Encoded size of a [`NetworkAddress`] inside `version`
const NETWORK_ADDRESS_SIZE: usize = 8 + 16 + 2;

bitflags! {
    /// Services advertised by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceFlags: u64 {
        const NETWORK = 1 << 0;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Network Address
// =============================================================================

/// Peer address as carried in `version` (no timestamp)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: ServiceFlags,
    /// IPv6, or IPv4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self {
            services: ServiceFlags::empty(),
            ip: Ipv6Addr::UNSPECIFIED.octets(),
            port: 0,
        }
    }
}

impl NetworkAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip: ip.octets(),
            port: addr.port(),
        }
    }

    /// Socket address, unwrapping IPv4-mapped addresses
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }

    fn decode(source: &mut &[u8]) -> Option<Self> {
        let services = ServiceFlags::from_bits_retain(read_u64_le(source)?);
        let ip: [u8; 16] = read_bytes(source, 16)?.try_into().ok()?;
        let port = read_u16_be(source)?;
        Some(Self { services, ip, port })
    }

    fn encode(&self, sink: &mut BytesMut) {
        sink.put_u64_le(self.services.bits());
        sink.put_slice(&self.ip);
        sink.put_u16(self.port);
    }
}

// =============================================================================
// Version
// =============================================================================

/// Protocol version announcement
///
/// Below `RELAY_VERSION` the relay flag is not carried on the wire and
/// reads as set; equality compares [`Version::relays`] rather than the raw
/// field for that reason.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub value: u32,
    pub services: ServiceFlags,
    /// Unix time in seconds
    pub timestamp: i64,
    pub address_receiver: NetworkAddress,
    pub address_sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
    /// Only encoded when `value >= RELAY_VERSION`
    pub relay: bool,
    valid: bool,
}

impl Version {
    /// Build a version stamped with the current time
    ///
    /// Invalid when the user agent is longer than `MAX_USER_AGENT`.
    pub fn new(
        value: u32,
        services: ServiceFlags,
        nonce: u64,
        user_agent: impl Into<String>,
        start_height: u32,
    ) -> Self {
        let user_agent = user_agent.into();
        Self {
            valid: user_agent.len() <= MAX_USER_AGENT,
            value,
            services,
            timestamp: chrono::Utc::now().timestamp(),
            address_receiver: NetworkAddress::default(),
            address_sender: NetworkAddress::default(),
            nonce,
            user_agent,
            start_height,
            relay: true,
        }
    }

    /// Whether the peer asked for transaction relay
    pub fn relays(&self) -> bool {
        self.value < RELAY_VERSION || self.relay
    }

    /// Set the receiver and sender addresses
    pub fn with_addresses(mut self, receiver: SocketAddr, sender: SocketAddr) -> Self {
        self.address_receiver = NetworkAddress::new(receiver, ServiceFlags::empty());
        self.address_sender = NetworkAddress::new(sender, self.services);
        self
    }

    fn decode(source: &mut &[u8]) -> Option<Self> {
        let value = read_u32_le(source)?;
        let services = ServiceFlags::from_bits_retain(read_u64_le(source)?);
        let timestamp = read_i64_le(source)?;
        let address_receiver = NetworkAddress::decode(source)?;
        let address_sender = NetworkAddress::decode(source)?;
        let nonce = read_u64_le(source)?;
        let user_agent = read_string(source, MAX_USER_AGENT)?;
        let start_height = read_u32_le(source)?;
        let relay = if value >= RELAY_VERSION {
            read_u8(source)? != 0
        } else {
            true
        };

        Some(Self {
            value,
            services,
            timestamp,
            address_receiver,
            address_sender,
            nonce,
            user_agent,
            start_height,
            relay,
            valid: true,
        })
    }
}

impl Message for Version {
    const COMMAND: &'static str = "version";

    fn from_data(&mut self, source: &mut &[u8]) -> bool {
        match Self::decode(source) {
            Some(version) => {
                *self = version;
                true
            }
            None => {
                self.reset();
                false
            }
        }
    }

    fn to_data(&self, sink: &mut BytesMut) {
        sink.put_u32_le(self.value);
        sink.put_u64_le(self.services.bits());
        sink.put_i64_le(self.timestamp);
        self.address_receiver.encode(sink);
        self.address_sender.encode(sink);
        sink.put_u64_le(self.nonce);
        write_string(sink, &self.user_agent);
        sink.put_u32_le(self.start_height);
        if self.value >= RELAY_VERSION {
            sink.put_u8(self.relay as u8);
        }
    }

    fn serialized_size(&self) -> usize {
        4 + 8
            + 8
            + 2 * NETWORK_ADDRESS_SIZE
            + 8
            + varint_size(self.user_agent.len() as u64)
            + self.user_agent.len()
            + 4
            + usize::from(self.value >= RELAY_VERSION)
    }

    fn is_valid(&self) -> bool {
        self.valid && self.user_agent.len() <= MAX_USER_AGENT
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.services == other.services
            && self.timestamp == other.timestamp
            && self.address_receiver == other.address_receiver
            && self.address_sender == other.address_sender
            && self.nonce == other.nonce
            && self.user_agent == other.user_agent
            && self.start_height == other.start_height
            && self.relays() == other.relays()
            && self.valid == other.valid
    }
}

impl Eq for Version {}
