//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Narrow interfaces to the collaborators this crate does not itself
//! implement: the ACL matcher, the FIB/forwarding-graph dispatcher, and
//! the routing back-walk notifier. This crate defines the traits and
//! message types only; wiring a concrete implementation to them is the
//! embedding router's job.

use std::net::{Ipv4Addr, Ipv6Addr};

/// One forwarding descriptor: a graph node to continue dispatch at, paired
/// with the adjacency it resolves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dpo {
    pub next_node: u32,
    pub adj_index: u32,
}

impl Dpo {
    pub const DROP_NODE: u32 = u32::MAX;

    /// A synthetic DPO used by the DROP fallback; carries no real adjacency.
    pub fn drop() -> Dpo {
        Dpo {
            next_node: Dpo::DROP_NODE,
            adj_index: u32::MAX,
        }
    }

    pub fn is_drop(&self) -> bool {
        self.next_node == Dpo::DROP_NODE
    }
}

/// One bucket of a FIB lookup's load-balance object.
pub trait LoadBalance {
    /// Number of ECMP buckets (always >= 1).
    fn n_buckets(&self) -> usize;

    /// The DPO at the given bucket index.
    fn bucket(&self, index: usize) -> Dpo;

    /// The FIB's configured flow-hash field selection, consumed by
    /// `FlowHasher` when the datapath needs to pick among multiple buckets.
    fn hash_config(&self) -> FlowHashConfig;
}

/// The FIB lookup surface the datapath consumes per packet.
pub trait FibLookup {
    type Lb: LoadBalance;

    fn lookup_v4(&self, packet: &PacketCtx) -> Self::Lb;
    fn lookup_v6(&self, packet: &PacketCtx) -> Self::Lb;
}

/// Selects fields the flow hash is computed over; mirrors the FIB's own
/// `flow_hash_v4`/`flow_hash_v6` config knob.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowHashConfig {
    pub src_ip: bool,
    pub dst_ip: bool,
    pub src_port: bool,
    pub dst_port: bool,
    pub protocol: bool,
    pub symmetric: bool,
}

/// The 5-tuple the ACL matcher and flow hasher both consume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FiveTuple {
    pub src_ip: IpAddrPair,
    pub dst_ip: IpAddrPair,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Either-family address pair, avoids forcing callers through an enum match
/// for the common case where the family is already known from context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpAddrPair {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// Opaque packet handle passed through the datapath; the engine never reads
/// its contents directly, only through the traits below.
pub struct PacketCtx<'a> {
    pub data: &'a [u8],
    pub family: crate::link::Family,
}

/// Computes a flow hash over a packet per a given field-selection config.
/// Invoked at most once per packet on the fast path.
pub trait FlowHasher {
    fn hash(&self, packet: &PacketCtx<'_>, config: FlowHashConfig) -> u32;
}

/// The compiled ACL matcher, fed a per-interface context built at attach
/// time, which owns the ACL lookup context.
pub trait AclMatcher {
    /// Builds the 5-tuple once per packet, prior to matching.
    fn fill_5tuple(
        &self,
        packet: &PacketCtx<'_>,
        family: crate::link::Family,
    ) -> FiveTuple;

    /// Matches the 5-tuple against the given context's compiled rule set,
    /// returning the position of the first matching rule if any.
    fn match_5tuple(&self, context: u32, tuple: &FiveTuple) -> Option<usize>;
}

/// An opaque handle to a routing back-walk subscription. Dropping it does
/// not unsubscribe; callers invoke `RoutingBackWalkSource::unregister`
/// explicitly, mirroring the explicit-release discipline of the Link/Policy
/// pools this crate owns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackWalkRegistration(pub u64);

/// The routing subsystem surface consumed for reachability tracking: a
/// registration handle returned by the routing subsystem plus a callback
/// closure, avoiding embedded intrusive nodes.
pub trait RoutingBackWalkSource {
    /// Subscribes `child` (an opaque handle the back-walk visitor will
    /// later pass back unchanged) as a child of the path resolving
    /// `next_hop`. Returns a registration the caller uses to unregister.
    fn register_child(
        &self,
        next_hop: ForwardingDescriptor,
        child: ChildHandle,
    ) -> BackWalkRegistration;

    /// Ends a subscription created by `register_child`.
    fn unregister(&self, registration: BackWalkRegistration);

    /// Re-resolves the forwarding descriptor for an existing registration,
    /// called by the owner on receipt of a back-walk notification.
    fn resolve(&self, registration: BackWalkRegistration) -> ForwardingDescriptor;

    /// Locates the FIB entry for the all-zeros prefix of the given family,
    /// if the routing table currently has one. Consulted lazily.
    fn default_route_entry(
        &self,
        family: crate::link::Family,
    ) -> Option<ForwardingDescriptor>;

    /// Enumerates the adjacencies currently reachable through a resolved
    /// forwarding descriptor (used by the Default-Route Tracker).
    fn adjacencies(&self, descriptor: &ForwardingDescriptor) -> Vec<u32>;
}

/// Opaque child identifier passed to `RoutingBackWalkSource::register_child`
/// and returned unchanged in back-walk callbacks; the owner dispatches by
/// index rather than storing an intrusive node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChildHandle(pub u64);

/// The result of resolving a next-hop through the routing subsystem: either
/// a single adjacency (reachable) or nothing (ARP/ND unresolved).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForwardingDescriptor {
    pub adj_index: Option<u32>,
    pub next_node: u32,
}

impl ForwardingDescriptor {
    pub fn is_reachable(&self) -> bool {
        self.adj_index.is_some()
    }
}
