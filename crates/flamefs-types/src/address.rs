use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Transport used to reach a node. Clients pick RDMA when available and
/// fall back to TCP.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum AddressType {
    TCP = 0,
    RDMA = 1,
    LOCAL = 2,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::TCP => write!(f, "TCP"),
            AddressType::RDMA => write!(f, "RDMA"),
            AddressType::LOCAL => write!(f, "LOCAL"),
        }
    }
}

/// Network address of a service endpoint: IPv4 (network byte order), port,
/// transport type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ip: u32,
    pub port: u16,
    pub addr_type: AddressType,
}

impl Address {
    pub fn new(ip: u32, port: u16, addr_type: AddressType) -> Self {
        Self {
            ip,
            port,
            addr_type,
        }
    }

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16, addr_type: AddressType) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
            addr_type,
        }
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }
}

impl Default for Address {
    fn default() -> Self {
        Self {
            ip: 0,
            port: 0,
            addr_type: AddressType::TCP,
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}://{}.{}.{}.{}:{}", self.addr_type, a, b, c, d, self.port)
    }
}
