//! Port mapping records and the per-interface, per-family tables that own them.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{net::InterfaceId, pcp::Nonce, Protocol};

/// Where a mapping is in its request/grant cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingState {
    /// A request was sent and no success response has been applied since.
    Requested,
    /// The gateway granted the mapping and it has not expired.
    Granted,
}

/// A single external-port-to-internal-port binding requested from a gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub nonce: Nonce,
    pub protocol: Protocol,
    /// The client address and internal port the mapping forwards to.
    pub internal: SocketAddr,
    /// Suggested external endpoint while requested, assigned external endpoint once granted.
    pub external: SocketAddr,
    /// The lifetime sent in requests.
    pub requested_lifetime: Duration,
    /// The lifetime granted by the gateway, or the requested one until a grant arrives.
    pub lifetime: Duration,
    /// When the mapping was last granted, or created while never granted.
    pub granted_at: Instant,
    pub expires_at: Option<Instant>,
    pub state: MappingState,
    pub interface: InterfaceId,
}

impl PortMapping {
    /// Record a grant. The expiry is one second short of the granted lifetime to
    /// absorb clock and interval rounding.
    pub fn grant(&mut self, external: SocketAddr, lifetime: Duration, now: Instant) {
        self.external = external;
        self.lifetime = lifetime;
        self.granted_at = now;
        self.expires_at = Some(now + lifetime.saturating_sub(Duration::from_secs(1)));
        self.state = MappingState::Granted;
    }

    /// Time left before the grant expires, zero once expired or never granted.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map_or(Duration::ZERO, |expires| expires.saturating_duration_since(now))
    }
}

/// Returned by a [`MappingTable::for_each`] visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Port mappings of one interface and address family, in insertion order.
#[derive(Debug, Default)]
pub struct MappingTable {
    mappings: Vec<PortMapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping with the same nonce, or append.
    pub fn insert_or_replace(&mut self, mapping: PortMapping) {
        match self.find_by_nonce_mut(&mapping.nonce) {
            Some(existing) => *existing = mapping,
            None => self.mappings.push(mapping),
        }
    }

    pub fn find_by_nonce(&self, nonce: &Nonce) -> Option<&PortMapping> {
        self.mappings.iter().find(|m| &m.nonce == nonce)
    }

    pub fn find_by_nonce_mut(&mut self, nonce: &Nonce) -> Option<&mut PortMapping> {
        self.mappings.iter_mut().find(|m| &m.nonce == nonce)
    }

    /// Visit every mapping in order. The visitor may ask for the mapping it is
    /// given to be removed; the remaining mappings are still visited.
    pub fn for_each(&mut self, mut visit: impl FnMut(&mut PortMapping) -> Visit) {
        self.mappings.retain_mut(|m| visit(m) == Visit::Keep);
    }

    pub fn remove(&mut self, nonce: &Nonce) -> Option<PortMapping> {
        let index = self.mappings.iter().position(|m| &m.nonce == nonce)?;
        Some(self.mappings.remove(index))
    }

    /// Drop every mapping. Nothing is sent to the gateway.
    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.iter()
    }
}

#[cfg(test)]
mod tests;
