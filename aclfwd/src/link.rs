//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Link Registry: the set of labeled transmit links, each tracking a
//! forwarding descriptor kept fresh by routing-layer back-walks.
//!
//! Links live in a `generational_arena::Arena`, indexed secondarily by
//! `interface_id` and by `label`, the same pooling an interface table would
//! use for its own arena. That arena is control-plane-only: a datapath
//! worker never gets a `&LinkRegistry` without the control-plane mutex, so
//! every value the hot path needs to read lives outside it, in
//! [`AdjacencyMaps`] (adjacency-indexed) and [`LabelRuntimes`]
//! (label-indexed), both `Arc`-shared so a worker never locks to read them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use generational_arena::{Arena, Index};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::default_route::DefaultRouteTracker;
use crate::error::Error;
use crate::external::{
    BackWalkRegistration, ChildHandle, Dpo, ForwardingDescriptor, LoadBalance,
    RoutingBackWalkSource,
};
use crate::quality::{AtomicQuality, Quality};

/// Sentinel stored in `admin_map`/`reachable_map` for "no labeled link".
pub const INVALID_LABEL: u8 = 255;

/// One past the highest valid label; sizes the label-indexed tables.
const LABEL_SLOTS: usize = INVALID_LABEL as usize;

/// Address family a Link, Attachment or Default-Route state belongs to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];
}

/// Direct-addressed `adjacency_id -> label` arrays. Mutated only through
/// single `u8` stores; reads never tear.
#[derive(Debug)]
pub struct AdjacencyMaps {
    admin: Vec<AtomicU8>,
    reachable: Vec<AtomicU8>,
}

impl AdjacencyMaps {
    pub fn new(max_adjacency: u32) -> Self {
        let len = max_adjacency as usize;
        AdjacencyMaps {
            admin: (0..len).map(|_| AtomicU8::new(INVALID_LABEL)).collect(),
            reachable: (0..len).map(|_| AtomicU8::new(INVALID_LABEL)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.admin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admin.is_empty()
    }

    pub fn admin_label(&self, adj: u32) -> Option<u8> {
        self.admin.get(adj as usize).map(|cell| cell.load(Ordering::Acquire))
    }

    pub fn reachable_label(&self, adj: u32) -> Option<u8> {
        self.reachable.get(adj as usize).map(|cell| cell.load(Ordering::Acquire))
    }

    fn set_admin(&self, adj: u32, label: u8) {
        if let Some(cell) = self.admin.get(adj as usize) {
            cell.store(label, Ordering::Release);
        }
    }

    fn set_reachable(&self, adj: u32, label: u8) {
        if let Some(cell) = self.reachable.get(adj as usize) {
            cell.store(label, Ordering::Release);
        }
    }

    fn clear(&self, adj: u32) {
        self.set_admin(adj, INVALID_LABEL);
        self.set_reachable(adj, INVALID_LABEL);
    }
}

/// `is_labeled_or_default_route(fib_result) -> bool` (spec.md §4.2): the
/// datapath's fast-reject check, consulted before ACL match and the
/// decision module bother running at all. True when any FIB bucket's
/// adjacency is administratively labeled or is a default-route adjacency;
/// false means the packet can never be policy-redirected and the engine
/// should get out of the way immediately.
pub fn is_labeled_or_default_route(
    maps: &AdjacencyMaps,
    default_route: &DefaultRouteTracker,
    family: Family,
    lb: &impl LoadBalance,
) -> bool {
    (0..lb.n_buckets()).any(|i| {
        let adj = lb.bucket(i).adj_index;
        maps.admin_label(adj).is_some_and(|label| label != INVALID_LABEL)
            || default_route.is_default_route_adjacency(adj, family)
    })
}

/// Per-label hit/miss counters surfaced by introspection: hits, misses, and
/// their enforced-bypass-path equivalents.
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub enforced_hits: AtomicU64,
    pub enforced_misses: AtomicU64,
}

impl LinkCounters {
    pub(crate) fn record(&self, resolved: bool, enforced: bool) {
        let counter = match (resolved, enforced) {
            (true, false) => &self.hits,
            (false, false) => &self.misses,
            (true, true) => &self.enforced_hits,
            (false, true) => &self.enforced_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.enforced_hits.load(Ordering::Relaxed),
            self.enforced_misses.load(Ordering::Relaxed),
        )
    }
}

/// A single label's lock-free runtime state: the DPO a default-route
/// override probe should use, plus quality and counters. Written by the
/// control-plane-held [`LinkRegistry`], read directly by the datapath.
#[derive(Debug, Default)]
struct LabelRuntime {
    dpo: ArcSwapOption<Dpo>,
    quality: AtomicQuality,
    counters: LinkCounters,
}

/// Label-indexed (`[0, 254]`) lock-free table, the sibling of
/// [`AdjacencyMaps`] for data the decision module keys by label rather than
/// by adjacency: the default-route bypass path's DPO and per-label counters.
#[derive(Debug)]
pub struct LabelRuntimes {
    slots: Vec<LabelRuntime>,
}

impl LabelRuntimes {
    pub fn new() -> Self {
        LabelRuntimes {
            slots: (0..LABEL_SLOTS).map(|_| LabelRuntime::default()).collect(),
        }
    }

    fn slot(&self, label: u8) -> &LabelRuntime {
        &self.slots[label as usize]
    }

    /// The labeled link's current DPO, if reachable; used exclusively by
    /// the default-route override bypass path.
    pub fn dpo(&self, label: u8) -> Option<Dpo> {
        self.slot(label).dpo.load_full().map(|dpo| *dpo)
    }

    fn set_dpo(&self, label: u8, dpo: Option<Dpo>) {
        self.slot(label).dpo.store(dpo.map(Arc::new));
    }

    pub fn quality(&self, label: u8) -> Quality {
        self.slot(label).quality.load()
    }

    pub fn counters(&self, label: u8) -> &LinkCounters {
        &self.slot(label).counters
    }
}

impl Default for LabelRuntimes {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered transmit link.
#[derive(Debug)]
pub struct Link {
    pub interface_id: u32,
    pub label: u8,
    pub family: Family,
    pub forwarding: ForwardingDescriptor,
    registration: BackWalkRegistration,
    /// Whether the link has ever been observed reachable (supplemented,
    /// informational only; the datapath never consults it).
    pub ever_reachable: bool,
}

impl Link {
    pub fn is_reachable(&self) -> bool {
        self.forwarding.is_reachable()
    }
}

/// Owned snapshot of a link's state and counters, returned by introspection.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LinkSnapshot {
    pub interface_id: u32,
    pub label: u8,
    pub family: Family,
    pub reachable: bool,
    pub ever_reachable: bool,
    pub quality: Quality,
    pub hits: u64,
    pub misses: u64,
    pub enforced_hits: u64,
    pub enforced_misses: u64,
}

#[derive(Debug)]
pub struct LinkRegistry {
    arena: Arena<Link>,
    by_interface: HashMap<u32, Index>,
    by_label: HashMap<u8, Index>,
    maps: Arc<AdjacencyMaps>,
    labels: Arc<LabelRuntimes>,
}

fn to_child_handle(index: Index) -> ChildHandle {
    let (arr_idx, generation) = index.into_raw_parts();
    ChildHandle(((arr_idx as u64) << 32) | generation)
}

fn from_child_handle(handle: ChildHandle) -> Index {
    let arr_idx = (handle.0 >> 32) as usize;
    let generation = handle.0 & 0xFFFF_FFFF;
    Index::from_raw_parts(arr_idx, generation)
}

impl LinkRegistry {
    pub fn new(maps: Arc<AdjacencyMaps>, labels: Arc<LabelRuntimes>) -> Self {
        LinkRegistry {
            arena: Arena::new(),
            by_interface: HashMap::new(),
            by_label: HashMap::new(),
            maps,
            labels,
        }
    }

    fn link_dpo(link: &Link) -> Option<Dpo> {
        link.forwarding.adj_index.map(|adj| Dpo {
            next_node: link.forwarding.next_node,
            adj_index: adj,
        })
    }

    /// Allocates a Link, subscribes it for routing back-walks, and installs
    /// its initial forwarding descriptor into both adjacency maps.
    pub fn link_add(
        &mut self,
        routing: &dyn RoutingBackWalkSource,
        interface_id: u32,
        label: u8,
        family: Family,
        next_hop: ForwardingDescriptor,
    ) -> Result<(), Error> {
        if label >= INVALID_LABEL {
            return Err(Error::LabelOutOfRange(label));
        }
        if self.by_interface.contains_key(&interface_id) {
            return Err(Error::InterfaceExists(interface_id));
        }
        if let Some(adj) = next_hop.adj_index
            && adj as usize >= self.maps.len()
        {
            return Err(Error::AdjacencyOutOfRange(adj, self.maps.len() as u32));
        }

        // Reserve the arena slot first so we know the child handle we'll
        // register with the routing subsystem, then fill in the real
        // registration once it is known.
        let placeholder = Link {
            interface_id,
            label,
            family,
            forwarding: next_hop,
            registration: BackWalkRegistration(0),
            ever_reachable: next_hop.is_reachable(),
        };
        let index = self.arena.insert(placeholder);
        let child = to_child_handle(index);
        let registration = routing.register_child(next_hop, child);
        let link = &mut self.arena[index];
        link.registration = registration;

        self.by_interface.insert(interface_id, index);
        self.by_label.insert(label, index);

        if let Some(adj) = next_hop.adj_index {
            self.maps.set_admin(adj, label);
            if next_hop.is_reachable() {
                self.maps.set_reachable(adj, label);
            }
        }
        if next_hop.is_reachable() {
            self.labels.set_dpo(label, Self::link_dpo(link));
        }

        debug!(interface_id, label, "link added");
        Ok(())
    }

    /// Idempotent on unknown interface. Invalidates the adjacency maps
    /// *before* tearing down the routing subscription, so a concurrent
    /// datapath read never observes a stale labeled adjacency after the
    /// Link starts being removed.
    pub fn link_del(&mut self, routing: &dyn RoutingBackWalkSource, interface_id: u32) {
        let Some(index) = self.by_interface.remove(&interface_id) else {
            return;
        };
        let link = &self.arena[index];
        self.by_label.remove(&link.label);
        if let Some(adj) = link.forwarding.adj_index {
            self.maps.clear(adj);
        }
        self.labels.set_dpo(link.label, None);
        routing.unregister(link.registration);
        self.arena.remove(index);
        debug!(interface_id, "link removed");
    }

    /// Re-reads the forwarding descriptor following a routing back-walk
    /// hitting `child`, updating `reachable_map` unconditionally and
    /// `admin_map` to the (unconditional) current label.
    pub fn on_back_walk(&mut self, routing: &dyn RoutingBackWalkSource, child: ChildHandle) {
        let index = from_child_handle(child);
        let Some(link) = self.arena.get_mut(index) else {
            // Stale notification for a link already removed; ignore.
            return;
        };

        let old_adj = link.forwarding.adj_index;
        let descriptor = routing.resolve(link.registration);
        link.forwarding = descriptor;
        if descriptor.is_reachable() {
            link.ever_reachable = true;
        }

        if let Some(adj) = old_adj
            && old_adj != descriptor.adj_index
        {
            self.maps.clear(adj);
        }
        if let Some(adj) = descriptor.adj_index {
            self.maps.set_admin(adj, link.label);
            self.maps.set_reachable(
                adj,
                if descriptor.is_reachable() {
                    link.label
                } else {
                    INVALID_LABEL
                },
            );
        }

        self.labels.set_dpo(
            link.label,
            if descriptor.is_reachable() {
                Self::link_dpo(link)
            } else {
                None
            },
        );

        if !descriptor.is_reachable() {
            warn!(
                interface_id = link.interface_id,
                "link's next-hop is no longer resolvable"
            );
        }
    }

    /// A link with `loss == 100` is administratively down for policy; only
    /// its `reachable_map` entry is cleared, `admin_map` is left untouched.
    pub fn quality_set(
        &self,
        interface_id: u32,
        loss: Option<u32>,
        delay_us: Option<u32>,
        jitter_us: Option<u32>,
    ) -> Result<(), Error> {
        let index = *self
            .by_interface
            .get(&interface_id)
            .ok_or(Error::InterfaceNotFound(interface_id))?;
        let link = &self.arena[index];
        let runtime_quality = &self.labels.slot(link.label).quality;
        if let Some(loss) = loss {
            runtime_quality.set_loss(loss);
        }
        if let Some(delay_us) = delay_us {
            runtime_quality.set_delay_us(delay_us);
        }
        if let Some(jitter_us) = jitter_us {
            runtime_quality.set_jitter_us(jitter_us);
        }

        if let Some(adj) = link.forwarding.adj_index {
            if runtime_quality.load().is_down() {
                self.maps.set_reachable(adj, INVALID_LABEL);
                self.labels.set_dpo(link.label, None);
            } else if link.forwarding.is_reachable() {
                self.maps.set_reachable(adj, link.label);
                self.labels.set_dpo(link.label, Self::link_dpo(link));
            }
        }
        Ok(())
    }

    pub fn get_by_interface(&self, interface_id: u32) -> Option<&Link> {
        self.by_interface
            .get(&interface_id)
            .map(|idx| &self.arena[*idx])
    }

    pub fn get_by_label(&self, label: u8) -> Option<&Link> {
        self.by_label.get(&label).map(|idx| &self.arena[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.arena.iter().map(|(_, link)| link)
    }

    pub fn dump(&self) -> Vec<LinkSnapshot> {
        self.iter()
            .map(|link| {
                let (hits, misses, enforced_hits, enforced_misses) =
                    self.labels.counters(link.label).snapshot();
                LinkSnapshot {
                    interface_id: link.interface_id,
                    label: link.label,
                    family: link.family,
                    reachable: link.is_reachable(),
                    ever_reachable: link.ever_reachable,
                    quality: self.labels.quality(link.label),
                    hits,
                    misses,
                    enforced_hits,
                    enforced_misses,
                }
            })
            .collect()
    }
}
