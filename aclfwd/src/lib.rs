//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! ACL-based multi-link forwarding engine for a software router's IP
//! unicast fast path.
//!
//! [`Engine`] is the crate's single entry point: it owns every
//! control-plane pool (Links, Policies, Attachments, the Default-Route
//! Tracker, the Local-Address Filter) behind one coarse
//! [`std::sync::Mutex`], and publishes everything the hot path needs to
//! read — `admin_map`/`reachable_map`, per-label quality/counters,
//! per-interface attachment lists — through lock-free `Arc`/`ArcSwap`
//! cells a worker thread reads without ever touching that mutex.
//! [`datapath::process_one`] is the per-packet entry point; it takes
//! a snapshot of these cells plus the embedder's FIB/ACL/flow-hash
//! collaborators and returns a [`datapath::Verdict`].
//!
//! The narrow external collaborators (the ACL matcher, the FIB, the
//! routing back-walk source) are traits in [`external`]; this crate ships
//! no implementation of them beyond test doubles.

pub mod attachment;
pub mod datapath;
pub mod decision;
pub mod default_route;
pub mod error;
pub mod external;
mod flowhash;
pub mod link;
pub mod local_addr;
pub mod policy;
pub mod quality;

use std::collections::HashMap;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::Code;

use attachment::AttachmentStore;
use datapath::InterfaceContext;
use default_route::DefaultRouteTracker;
use error::to_code;
use external::{ChildHandle, ForwardingDescriptor, RoutingBackWalkSource};
use link::{AdjacencyMaps, Family, LabelRuntimes, LinkRegistry, LinkSnapshot};
use local_addr::LocalAddressFilter;
use policy::{DefaultRouteAction, Policy, PolicyAction, PolicyStore};
use std::sync::Arc;

/// Process-wide knobs outside the persisted/wire configuration surface:
/// the adjacency-space bound and, optionally, the service class this
/// engine's quality filtering enforces.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Upper bound of the adjacency index space, assumed bounded (e.g.
    /// 65535). Sizes `admin_map`/`reachable_map` and the Default-Route
    /// Tracker's bitmap.
    pub max_adjacency: u32,
    /// Service class this engine enforces tolerance for when resolving
    /// labels; `None` disables quality filtering entirely.
    pub service_class: Option<quality::ServiceClass>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_adjacency: 65_535,
            service_class: None,
        }
    }
}

/// Key identifying one interface's attachment list and ACL-lookup context.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct InterfaceKey {
    rx_interface: u32,
    family: Family,
}

/// Everything guarded by the control-plane mutex. No datapath code ever
/// touches this type directly — it reads the `Engine`-level `Arc`/`ArcSwap`
/// fields published alongside it instead.
struct EngineState {
    links: LinkRegistry,
    policies: PolicyStore,
    attachments: AttachmentStore,
    default_route: DefaultRouteTracker,
    acl_contexts: HashMap<InterfaceKey, u32>,
    next_acl_context: u32,
}

/// The engine's single entry point: aggregates the Link Registry, Policy
/// Store, Attachment Store, Default-Route Tracker and Local-Address
/// Filter, and exposes the control-plane operations plus the datapath
/// snapshot accessors `datapath::process_one` needs.
pub struct Engine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    maps: Arc<AdjacencyMaps>,
    labels: Arc<LabelRuntimes>,
    default_route_action: DefaultRouteAction,
    local_addrs: ArcSwap<LocalAddressFilter>,
    /// Per-(interface, family) datapath context, rebuilt and republished as
    /// a whole on every `attach`/`detach` via a single pointer swap, so
    /// `interface_context` never takes `state`'s mutex.
    interface_contexts: ArcSwap<HashMap<InterfaceKey, InterfaceContext>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let maps = Arc::new(AdjacencyMaps::new(config.max_adjacency));
        let labels = Arc::new(LabelRuntimes::new());
        Engine {
            config,
            state: Mutex::new(EngineState {
                links: LinkRegistry::new(maps.clone(), labels.clone()),
                policies: PolicyStore::new(),
                attachments: AttachmentStore::new(),
                default_route: DefaultRouteTracker::new(config.max_adjacency),
                acl_contexts: HashMap::new(),
                next_acl_context: 0,
            }),
            maps,
            labels,
            default_route_action: DefaultRouteAction::default(),
            local_addrs: ArcSwap::from_pointee(LocalAddressFilter::new()),
            interface_contexts: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    // ===== datapath-facing lock-free accessors =====

    pub fn adjacency_maps(&self) -> &AdjacencyMaps {
        &self.maps
    }

    pub fn label_runtimes(&self) -> &LabelRuntimes {
        &self.labels
    }

    pub fn default_route_action(&self) -> &DefaultRouteAction {
        &self.default_route_action
    }

    pub fn local_addrs(&self) -> Arc<LocalAddressFilter> {
        self.local_addrs.load_full()
    }

    pub fn service_class(&self) -> Option<quality::ServiceClass> {
        self.config.service_class
    }

    /// Returns the published datapath context for `(rx_interface, family)`,
    /// lock-free. `None` means the feature is not enabled on that
    /// interface/family — the caller should not even reach this engine's
    /// datapath node.
    pub fn interface_context(
        &self,
        rx_interface: u32,
        family: Family,
    ) -> Option<InterfaceContext> {
        self.interface_contexts
            .load()
            .get(&InterfaceKey {
                rx_interface,
                family,
            })
            .cloned()
    }

    // ===== Link Registry =====

    pub fn link_add(
        &self,
        routing: &dyn RoutingBackWalkSource,
        interface_id: u32,
        label: u8,
        family: Family,
        next_hop: ForwardingDescriptor,
    ) -> Code {
        let mut state = self.state.lock().unwrap();
        let result = state
            .links
            .link_add(routing, interface_id, label, family, next_hop);
        if result.is_ok() {
            for family in Family::ALL {
                state.default_route.try_init(routing, family);
            }
        }
        to_code(result)
    }

    pub fn link_del(&self, routing: &dyn RoutingBackWalkSource, interface_id: u32) -> Code {
        let mut state = self.state.lock().unwrap();
        state.links.link_del(routing, interface_id);
        Code::Ok
    }

    pub fn quality_set(
        &self,
        interface_id: u32,
        loss: Option<u32>,
        delay_us: Option<u32>,
        jitter_us: Option<u32>,
    ) -> Code {
        let state = self.state.lock().unwrap();
        to_code(state.links.quality_set(interface_id, loss, delay_us, jitter_us))
    }

    pub fn dump_links(&self) -> Vec<LinkSnapshot> {
        self.state.lock().unwrap().links.dump()
    }

    // ===== routing back-walk dispatch =====

    /// Dispatches one routing back-walk notification to the Link Registry
    /// or the Default-Route Tracker, by the opaque `child` handle the
    /// notification carries.
    pub fn on_back_walk(&self, routing: &dyn RoutingBackWalkSource, child: ChildHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(family) = default_route::family_for_child_handle(child) {
            state.default_route.on_back_walk(routing, family);
        } else {
            state.links.on_back_walk(routing, child);
        }
    }

    pub fn is_default_route_adjacency(&self, adj: u32, family: Family) -> bool {
        self.state
            .lock()
            .unwrap()
            .default_route
            .is_default_route_adjacency(adj, family)
    }

    // ===== Policy Store =====

    pub fn policy_add(&self, policy_id: u32, acl_id: u32, action: PolicyAction) -> Code {
        let mut state = self.state.lock().unwrap();
        to_code(state.policies.policy_add(policy_id, acl_id, action))
    }

    pub fn policy_delete(&self, policy_id: u32) -> Code {
        let mut state = self.state.lock().unwrap();
        to_code(state.policies.policy_delete(policy_id))
    }

    pub fn get_policy(&self, policy_id: u32) -> Option<Arc<Policy>> {
        self.state.lock().unwrap().policies.get(policy_id)
    }

    pub fn dump_policies(&self) -> Vec<(u32, u32, u32)> {
        self.state
            .lock()
            .unwrap()
            .policies
            .iter()
            .map(|policy| (policy.policy_id, policy.acl_id, policy.ref_count()))
            .collect()
    }

    pub fn default_route_action_set(&self, action: PolicyAction) {
        self.default_route_action.set(action);
        debug!("default-route override action installed");
    }

    pub fn default_route_action_clear(&self) {
        self.default_route_action.clear();
        debug!("default-route override action cleared");
    }

    // ===== Attachment Store =====

    pub fn attach(
        &self,
        policy_id: u32,
        rx_interface: u32,
        family: Family,
        priority: u32,
    ) -> Code {
        let mut state = self.state.lock().unwrap();
        let result = state
            .attachments
            .attach(&state.policies, policy_id, rx_interface, family, priority);
        if let Err(error) = result {
            return to_code(Err(error));
        }
        self.republish_interface_context(&mut state, rx_interface, family);
        Code::Ok
    }

    pub fn detach(&self, policy_id: u32, rx_interface: u32, family: Family) -> Code {
        let mut state = self.state.lock().unwrap();
        let result =
            state
                .attachments
                .detach(&state.policies, policy_id, rx_interface, family);
        if let Err(error) = result {
            return to_code(Err(error));
        }
        self.republish_interface_context(&mut state, rx_interface, family);
        Code::Ok
    }

    pub fn dump_attachments(&self) -> Vec<attachment::AttachmentEntry> {
        self.state.lock().unwrap().attachments.dump()
    }

    /// Rebuilds and republishes the `(rx_interface, family)` slot of
    /// `interface_contexts` as a whole via a single pointer swap,
    /// allocating a fresh ACL-lookup context id the first time the
    /// interface/family pair gets an attachment and dropping the mapping
    /// once its list goes empty, releasing the ACL context.
    fn republish_interface_context(
        &self,
        state: &mut EngineState,
        rx_interface: u32,
        family: Family,
    ) {
        let key = InterfaceKey {
            rx_interface,
            family,
        };
        let attachments = state
            .attachments
            .get(rx_interface, family)
            .unwrap_or_else(|| Arc::new(Vec::new()));

        let mut published = (**self.interface_contexts.load()).clone();
        if attachments.is_empty() {
            state.acl_contexts.remove(&key);
            published.remove(&key);
        } else {
            let acl_context = *state.acl_contexts.entry(key).or_insert_with(|| {
                let id = state.next_acl_context;
                state.next_acl_context += 1;
                id
            });
            published.insert(
                key,
                InterfaceContext {
                    acl_context,
                    attachments,
                },
            );
        }
        self.interface_contexts.store(Arc::new(published));
    }

    // ===== Local-Address Filter =====

    pub fn local_addr_add_v4(&self, addr: std::net::Ipv4Addr) {
        self.rcu_local_addrs(|filter| filter.add_v4(addr));
    }

    pub fn local_addr_remove_v4(&self, addr: std::net::Ipv4Addr) {
        self.rcu_local_addrs(|filter| filter.remove_v4(&addr));
    }

    pub fn local_addr_add_v6(&self, addr: std::net::Ipv6Addr) {
        self.rcu_local_addrs(|filter| filter.add_v6(addr));
    }

    pub fn local_addr_remove_v6(&self, addr: std::net::Ipv6Addr) {
        self.rcu_local_addrs(|filter| filter.remove_v6(&addr));
    }

    fn rcu_local_addrs(&self, mutate: impl FnOnce(&mut LocalAddressFilter)) {
        let current = self.local_addrs.load_full();
        let mut next = (*current).clone();
        mutate(&mut next);
        self.local_addrs.store(Arc::new(next));
    }

    // ===== Default-Route Tracker introspection =====

    pub fn dump_default_route_adjacencies(&self, family: Family, max_adj: u32) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        (0..max_adj)
            .filter(|&adj| state.default_route.is_default_route_adjacency(adj, family))
            .collect()
    }
}
