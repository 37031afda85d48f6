//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Default-Route Tracker: per family, the set of adjacencies currently
//! reachable via the default route, exposed as an O(1) query.
//!
//! The adjacency set is a packed bitmap (`bitvec`, a natural fit for a
//! bounded index space with word-sized membership tests) published
//! through `ArcSwap` so the datapath reads it without ever taking the
//! control-plane lock, reusing the same single-pointer-swap mechanism
//! attachment lists use.

use arc_swap::ArcSwap;
use bitvec::prelude::{BitBox, bitbox};
use tracing::debug;

use crate::external::{ChildHandle, RoutingBackWalkSource};
use crate::link::Family;

/// Reserved child handles for the two family trackers; the routing
/// subsystem passes these back unchanged on back-walks hitting the
/// default-route entry, dispatching by opaque handle rather than an
/// embedded node.
const CHILD_HANDLE_V4: ChildHandle = ChildHandle(u64::MAX);
const CHILD_HANDLE_V6: ChildHandle = ChildHandle(u64::MAX - 1);

fn child_handle(family: Family) -> ChildHandle {
    match family {
        Family::V4 => CHILD_HANDLE_V4,
        Family::V6 => CHILD_HANDLE_V6,
    }
}

pub fn family_for_child_handle(handle: ChildHandle) -> Option<Family> {
    match handle {
        CHILD_HANDLE_V4 => Some(Family::V4),
        CHILD_HANDLE_V6 => Some(Family::V6),
        _ => None,
    }
}

/// One family's default-route state. `NotTracked -> Tracking` transition is
/// lazy: `try_init` is retried on every `link_add` until a FIB entry for
/// the all-zeros prefix exists.
struct DefaultRouteState {
    registration: Option<crate::external::BackWalkRegistration>,
    adjacency_set: ArcSwap<BitBox>,
}

impl DefaultRouteState {
    fn new(max_adjacency: u32) -> Self {
        DefaultRouteState {
            registration: None,
            adjacency_set: ArcSwap::from_pointee(bitbox![0; max_adjacency as usize]),
        }
    }
}

pub struct DefaultRouteTracker {
    max_adjacency: u32,
    states: [DefaultRouteState; 2],
}

impl DefaultRouteTracker {
    pub fn new(max_adjacency: u32) -> Self {
        DefaultRouteTracker {
            max_adjacency,
            states: [
                DefaultRouteState::new(max_adjacency),
                DefaultRouteState::new(max_adjacency),
            ],
        }
    }

    fn state(&self, family: Family) -> &DefaultRouteState {
        &self.states[family as usize]
    }

    fn state_mut(&mut self, family: Family) -> &mut DefaultRouteState {
        &mut self.states[family as usize]
    }

    /// Retries locating the default-route FIB entry if not yet tracking;
    /// called every time a Link is added.
    pub fn try_init(&mut self, routing: &dyn RoutingBackWalkSource, family: Family) {
        if self.state(family).registration.is_some() {
            return;
        }
        let Some(entry) = routing.default_route_entry(family) else {
            return;
        };
        let registration = routing.register_child(entry, child_handle(family));
        self.recompute(routing, family, registration);
        self.state_mut(family).registration = Some(registration);
        debug!(?family, "default-route tracking started");
    }

    /// Recomputes the adjacency set following a back-walk and republishes
    /// it as a whole: workers see either the old or the new set, never a
    /// partial one.
    pub fn on_back_walk(&mut self, routing: &dyn RoutingBackWalkSource, family: Family) {
        let Some(registration) = self.state(family).registration else {
            return;
        };
        self.recompute(routing, family, registration);
    }

    fn recompute(
        &mut self,
        routing: &dyn RoutingBackWalkSource,
        family: Family,
        registration: crate::external::BackWalkRegistration,
    ) {
        let descriptor = routing.resolve(registration);
        let mut set = bitbox![0; self.max_adjacency as usize];
        if descriptor.is_reachable() {
            for adj in routing.adjacencies(&descriptor) {
                if let Some(mut bit) = set.get_mut(adj as usize) {
                    *bit = true;
                }
            }
        }
        self.state(family).adjacency_set.store(std::sync::Arc::new(set));
    }

    pub fn is_default_route_adjacency(&self, adj: u32, family: Family) -> bool {
        let set = self.state(family).adjacency_set.load();
        set.get(adj as usize).map(|bit| *bit).unwrap_or(false)
    }
}
