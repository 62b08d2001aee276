//! Endpoint addressing.
//!
//! Every steady-state message carries a `src` and a `dst` [`Address`]. The
//! controller itself is always `(Controller, 0)`; broadcast addresses carry the
//! discriminant of the class they target in their `id`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of endpoint an [`Address`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressType {
    Controller,
    Host,
    Instance,
    Control,
    Broadcast,
}

impl AddressType {
    /// Numeric discriminant used as the `id` of broadcast addresses.
    pub fn discriminant(self) -> u32 {
        match self {
            AddressType::Controller => 0,
            AddressType::Host => 1,
            AddressType::Instance => 2,
            AddressType::Control => 3,
            AddressType::Broadcast => 4,
        }
    }

    pub fn from_discriminant(value: u32) -> Option<Self> {
        match value {
            0 => Some(AddressType::Controller),
            1 => Some(AddressType::Host),
            2 => Some(AddressType::Instance),
            3 => Some(AddressType::Control),
            4 => Some(AddressType::Broadcast),
            _ => None,
        }
    }
}

/// Which live links a broadcast address reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastClass {
    /// Every host link. Used for both host and instance broadcasts.
    Hosts,
    /// Every control link.
    Controls,
}

/// Identifies one endpoint in the cluster.
///
/// Addresses are plain values: two addresses are equal iff both their type
/// and their id match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub id: u32,
}

impl Address {
    pub const CONTROLLER: Address = Address {
        address_type: AddressType::Controller,
        id: 0,
    };

    pub fn new(address_type: AddressType, id: u32) -> Self {
        Self { address_type, id }
    }

    pub fn host(id: u32) -> Self {
        Self::new(AddressType::Host, id)
    }

    pub fn instance(id: u32) -> Self {
        Self::new(AddressType::Instance, id)
    }

    pub fn control(id: u32) -> Self {
        Self::new(AddressType::Control, id)
    }

    /// Creates a broadcast address targeting every endpoint of `target`.
    pub fn broadcast(target: AddressType) -> Self {
        Self::new(AddressType::Broadcast, target.discriminant())
    }

    pub fn is_controller(&self) -> bool {
        self.address_type == AddressType::Controller
    }

    pub fn is_broadcast(&self) -> bool {
        self.address_type == AddressType::Broadcast
    }

    /// Resolves the link class a broadcast address reaches.
    ///
    /// Returns `None` for non-broadcast addresses and for broadcast ids that do
    /// not name a host, instance or control class.
    pub fn broadcast_class(&self) -> Option<BroadcastClass> {
        if !self.is_broadcast() {
            return None;
        }
        match AddressType::from_discriminant(self.id)? {
            AddressType::Host | AddressType::Instance => Some(BroadcastClass::Hosts),
            AddressType::Control => Some(BroadcastClass::Controls),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address_type {
            AddressType::Controller => write!(f, "controller"),
            AddressType::Host => write!(f, "host:{}", self.id),
            AddressType::Instance => write!(f, "instance:{}", self.id),
            AddressType::Control => write!(f, "control:{}", self.id),
            AddressType::Broadcast => match AddressType::from_discriminant(self.id) {
                Some(target) => write!(f, "broadcast:{:?}", target),
                None => write!(f, "broadcast:{}", self.id),
            },
        }
    }
}
