//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Datapath Node: runs in the graph, per packet. Reads the FIB lookup
//! result and the per-interface attachment list, invokes the ACL matcher
//! and the Policy Decision Module, and resolves a next-node + adjacency
//! for the caller to enqueue onto.
//!
//! Everything this module touches is lock-free: [`crate::attachment::AttachmentStore`]
//! lists, [`crate::link::AdjacencyMaps`]/[`crate::link::LabelRuntimes`], and
//! the [`crate::policy::DefaultRouteAction`] override are all read through
//! `Arc`/`ArcSwap` snapshots taken once per packet, never through the
//! control-plane mutex. The datapath is non-blocking; it never suspends.

use std::sync::Arc;

use crate::decision::{self, FlowHash};
use crate::default_route::DefaultRouteTracker;
use crate::external::{AclMatcher, Dpo, FibLookup, FlowHasher, IpAddrPair, LoadBalance, PacketCtx};
use crate::link::{AdjacencyMaps, Family, LabelRuntimes};
use crate::local_addr::LocalAddressFilter;
use crate::policy::DefaultRouteAction;
use crate::quality::ServiceClass;

/// Per-interface state the datapath needs on every packet: the ACL context
/// to match against and the (possibly empty) attachment list, published
/// together so a reader never observes a context/list pair that does not
/// correspond to the same `attach`/`detach` generation.
#[derive(Clone)]
pub struct InterfaceContext {
    pub acl_context: u32,
    pub attachments: Arc<Vec<crate::attachment::AttachmentEntry>>,
}

/// Where a packet ends up: either the engine's own DPO (policy-selected or
/// DROP) or "defer to the FIB", in which case the caller picks a bucket
/// from the load-balance object using its own hash config.
#[derive(Clone, Copy, Debug)]
pub enum Verdict {
    Policy(Dpo),
    Fib,
}

/// Immutable, per-packet collaborators the embedder supplies. Borrowed for
/// the duration of `process_one`; nothing here is stored past the call.
pub struct DatapathInputs<'a, F, A, H>
where
    F: FibLookup,
    A: AclMatcher,
    H: FlowHasher,
{
    pub fib: &'a F,
    pub acl: &'a A,
    pub hasher: &'a H,
    pub local_addrs: &'a LocalAddressFilter,
    pub maps: &'a AdjacencyMaps,
    pub labels: &'a LabelRuntimes,
    pub default_route: &'a DefaultRouteTracker,
    pub default_route_action: &'a DefaultRouteAction,
    pub service_class: Option<ServiceClass>,
}

/// Runs the per-packet forwarding decision against one packet, given the
/// interface's attachment context. Returns the graph verdict; the caller
/// is responsible for actually enqueueing onto the chosen next node (this
/// crate has no graph dispatcher of its own).
pub fn process_one<F, A, H>(
    inputs: &DatapathInputs<'_, F, A, H>,
    packet: &PacketCtx<'_>,
    family: Family,
    context: Option<&InterfaceContext>,
) -> Verdict
where
    F: FibLookup,
    A: AclMatcher,
    H: FlowHasher,
{
    let lb = match family {
        Family::V4 => inputs.fib.lookup_v4(packet),
        Family::V6 => inputs.fib.lookup_v6(packet),
    };

    let Some(context) = context else {
        return Verdict::Fib;
    };
    if context.attachments.is_empty() {
        return Verdict::Fib;
    }

    // Fast-reject (spec.md §4.2's `is_labeled_or_default_route`): a packet
    // whose FIB buckets are neither labeled nor default-route adjacencies
    // can never be policy-redirected, so skip the ACL match and decision
    // module entirely.
    if !crate::link::is_labeled_or_default_route(inputs.maps, inputs.default_route, family, &lb) {
        return Verdict::Fib;
    }

    let tuple = inputs.acl.fill_5tuple(packet, family);
    if is_locally_destined(inputs.local_addrs, &tuple.dst_ip) {
        return Verdict::Fib;
    }

    let Some(acl_pos) = inputs.acl.match_5tuple(context.acl_context, &tuple) else {
        return Verdict::Fib;
    };
    let Some(attachment) = context.attachments.get(acl_pos) else {
        // ACL position outside the attachment list is a collaborator bug,
        // not an engine fault; fail soft by deferring to the FIB.
        return Verdict::Fib;
    };
    let policy = &attachment.policy;

    let is_default_route = first_bucket_is_default_route(&lb, inputs.default_route, family);

    let (action, is_override) = match (is_default_route, inputs.default_route_action.get()) {
        (true, Some(override_action)) => (override_action, true),
        _ => (policy.action.clone(), false),
    };

    let flow_hash = FlowHash::new(inputs.hasher, packet, lb.hash_config());
    let tolerance = inputs.service_class.map(|class| class.tolerance());
    let decision = decision::decide(
        &action,
        &policy.counters,
        is_default_route,
        is_override,
        &flow_hash,
        &lb,
        inputs.labels,
        inputs.maps,
        tolerance.as_ref(),
    );

    if decision.use_policy_dpo {
        Verdict::Policy(decision.dpo)
    } else {
        Verdict::Fib
    }
}

/// Runs `process_one` over a batch of packets. Correctness depends only
/// on the per-packet call; looping here is purely a throughput convenience
/// for callers that already group packets into frames.
pub fn process_batch<F, A, H>(
    inputs: &DatapathInputs<'_, F, A, H>,
    packets: &[(PacketCtx<'_>, Family, Option<InterfaceContext>)],
) -> Vec<Verdict>
where
    F: FibLookup,
    A: AclMatcher,
    H: FlowHasher,
{
    packets
        .iter()
        .map(|(packet, family, context)| process_one(inputs, packet, *family, context.as_ref()))
        .collect()
}

/// Bypasses policy for locally-destined traffic: the engine never
/// redirects a packet whose destination is one of the router's own
/// addresses.
fn is_locally_destined(filter: &LocalAddressFilter, dst: &IpAddrPair) -> bool {
    match dst {
        IpAddrPair::V4(addr) => filter.contains_v4(addr),
        IpAddrPair::V6(addr) => filter.contains_v6(addr),
    }
}

/// Only the FIB's *first* bucket is consulted for the default-route
/// override decision, not "any bucket" (see DESIGN.md for the rationale).
fn first_bucket_is_default_route(
    lb: &impl LoadBalance,
    tracker: &DefaultRouteTracker,
    family: Family,
) -> bool {
    if lb.n_buckets() == 0 {
        return false;
    }
    let bucket = lb.bucket(0);
    tracker.is_default_route_adjacency(bucket.adj_index, family)
}

/// Standard FIB forwarding used whenever the policy defers: pick a bucket,
/// either the single one or by hashing the 5-tuple per the FIB's own hash
/// config.
pub fn fib_forward<H: FlowHasher>(
    lb: &impl LoadBalance,
    hasher: &H,
    packet: &PacketCtx<'_>,
) -> Dpo {
    let n = lb.n_buckets();
    if n <= 1 {
        return lb.bucket(0);
    }
    let hash = hasher.hash(packet, lb.hash_config());
    let idx = crate::flowhash::pick_index(hash, crate::flowhash::pow2_mask_for(n), n - 1);
    lb.bucket(idx)
}
