//! Stack configuration descriptors.
//!
//! A [`StackConfig`] is a pure data value describing which protocol layers
//! a stack variant composes, plus UDP-over-Gattlink addressing. The
//! descriptor token ("G", "SNG", "DSNG") is consumed verbatim by the
//! layer-graph builder and is a stable wire-level contract.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which protocol layers a stack composes, bottom to top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackDescriptor {
    /// Gattlink only.
    Gattlink,
    /// Socket over network interface over Gattlink.
    SocketNetifGattlink,
    /// DTLS over socket over network interface over Gattlink.
    DtlsSocketNetifGattlink,
}

impl StackDescriptor {
    /// Descriptor token consumed by the layer-graph builder.
    pub fn token(&self) -> &'static str {
        match self {
            StackDescriptor::Gattlink => "G",
            StackDescriptor::SocketNetifGattlink => "SNG",
            StackDescriptor::DtlsSocketNetifGattlink => "DSNG",
        }
    }

    /// Whether this variant routes through the lwIP network interface.
    /// True for every variant except the minimal Gattlink-only stack.
    pub fn is_lwip_based(&self) -> bool {
        !matches!(self, StackDescriptor::Gattlink)
    }

    /// Whether this variant runs a DTLS session on top.
    pub fn has_dtls(&self) -> bool {
        matches!(self, StackDescriptor::DtlsSocketNetifGattlink)
    }
}

impl fmt::Display for StackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Error parsing a descriptor token.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown stack descriptor: {0}")]
pub struct UnknownDescriptor(pub String);

impl FromStr for StackDescriptor {
    type Err = UnknownDescriptor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G" => Ok(StackDescriptor::Gattlink),
            "SNG" => Ok(StackDescriptor::SocketNetifGattlink),
            "DSNG" => Ok(StackDescriptor::DtlsSocketNetifGattlink),
            other => Err(UnknownDescriptor(other.to_string())),
        }
    }
}

/// Which side of the link this stack takes.
///
/// A node talks up to a hub; the role selects the DTLS handshake side
/// (node = client, hub = server) in the layer-graph builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackRole {
    Node,
    Hub,
}

impl StackRole {
    /// True when this stack takes the node (client) side.
    pub fn is_node(&self) -> bool {
        matches!(self, StackRole::Node)
    }
}

/// Immutable description of a stack variant plus addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Layer composition.
    pub descriptor: StackDescriptor,
    /// Local UDP-over-Gattlink address.
    pub local_address: Ipv4Addr,
    /// Local UDP-over-Gattlink port.
    pub local_port: u16,
    /// Remote UDP-over-Gattlink address.
    pub remote_address: Ipv4Addr,
    /// Remote UDP-over-Gattlink port.
    pub remote_port: u16,
}

impl StackConfig {
    /// Create a config with default addressing (0.0.0.0:0 both sides).
    pub fn new(descriptor: StackDescriptor) -> Self {
        Self {
            descriptor,
            local_address: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_address: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        }
    }

    /// Gattlink-only variant ("G").
    pub fn gattlink() -> Self {
        Self::new(StackDescriptor::Gattlink)
    }

    /// Socket + netif + Gattlink variant ("SNG").
    pub fn socket_netif_gattlink() -> Self {
        Self::new(StackDescriptor::SocketNetifGattlink)
    }

    /// DTLS + socket + netif + Gattlink variant ("DSNG").
    pub fn dtls_socket_netif_gattlink() -> Self {
        Self::new(StackDescriptor::DtlsSocketNetifGattlink)
    }

    /// Override the local endpoint.
    pub fn with_local(mut self, address: Ipv4Addr, port: u16) -> Self {
        self.local_address = address;
        self.local_port = port;
        self
    }

    /// Override the remote endpoint.
    pub fn with_remote(mut self, address: Ipv4Addr, port: u16) -> Self {
        self.remote_address = address;
        self.remote_port = port;
        self
    }

    /// Whether this config routes through the lwIP network interface.
    pub fn is_lwip_based(&self) -> bool {
        self.descriptor.is_lwip_based()
    }
}
