//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Policy Store: CRUD for `(acl_id, action)` pairs, pooled the same way
//! the Link Registry pools links — a `generational_arena::Arena` keyed
//! secondarily by the caller-supplied `policy_id`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use generational_arena::{Arena, Index};

use crate::error::Error;
use crate::flowhash::pow2_mask_for;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Selection {
    Ordered,
    Random,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fallback {
    DefaultRoute,
    Drop,
}

/// A group of labels within an action. `n_minus_1`/`pow2_mask` are derived
/// once here rather than recomputed on the fast path.
#[derive(Clone, Debug)]
pub struct Group {
    pub link_selection: Selection,
    pub labels: Vec<u8>,
    pub n_minus_1: usize,
    pub pow2_mask: u32,
}

impl Group {
    pub fn new(link_selection: Selection, labels: Vec<u8>) -> Self {
        let n_minus_1 = labels.len().saturating_sub(1);
        let pow2_mask = pow2_mask_for(labels.len());
        Group {
            link_selection,
            labels,
            n_minus_1,
            pow2_mask,
        }
    }
}

/// The selection algorithm plus the ordered list of groups plus the
/// fallback taken when nothing resolves.
#[derive(Clone, Debug)]
pub struct PolicyAction {
    pub fallback: Fallback,
    pub group_selection: Selection,
    pub groups: Vec<Group>,
    pub n_minus_1: usize,
    pub pow2_mask: u32,
}

impl PolicyAction {
    pub fn new(
        fallback: Fallback,
        group_selection: Selection,
        groups: Vec<Group>,
    ) -> Self {
        let n_minus_1 = groups.len().saturating_sub(1);
        let pow2_mask = pow2_mask_for(groups.len());
        PolicyAction {
            fallback,
            group_selection,
            groups,
            n_minus_1,
            pow2_mask,
        }
    }
}

/// Matched/applied/fallback/dropped/default-route counters.
#[derive(Debug, Default)]
pub struct PolicyCounters {
    pub matched: AtomicU64,
    pub applied: AtomicU64,
    pub fallback: AtomicU64,
    pub dropped: AtomicU64,
    pub default_route: AtomicU64,
}

#[derive(Debug)]
pub struct Policy {
    pub policy_id: u32,
    pub acl_id: u32,
    pub action: Arc<PolicyAction>,
    ref_count: AtomicU32,
    pub counters: PolicyCounters,
}

impl Policy {
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub(crate) fn incref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decref(&self) {
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Policies live in the arena wrapped in `Arc` so that an `Attachment` can
/// clone out a snapshot reference at `attach` time: the datapath then reads
/// a policy's action/counters straight off the `AttachmentEntry` it already
/// holds, never touching this arena or its guarding mutex (see
/// `AttachmentEntry::policy` and DESIGN.md's divergence note — the
/// reference is still conceptually an index, just one a worker can follow
/// without a lock).
#[derive(Debug)]
pub struct PolicyStore {
    arena: Arena<Arc<Policy>>,
    by_id: HashMap<u32, Index>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        PolicyStore {
            arena: Arena::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn policy_add(
        &mut self,
        policy_id: u32,
        acl_id: u32,
        action: PolicyAction,
    ) -> Result<(), Error> {
        if self.by_id.contains_key(&policy_id) {
            return Err(Error::PolicyExists(policy_id));
        }
        let policy = Policy {
            policy_id,
            acl_id,
            action: Arc::new(action),
            ref_count: AtomicU32::new(0),
            counters: PolicyCounters::default(),
        };
        let index = self.arena.insert(Arc::new(policy));
        self.by_id.insert(policy_id, index);
        Ok(())
    }

    pub fn policy_delete(&mut self, policy_id: u32) -> Result<(), Error> {
        let index = *self
            .by_id
            .get(&policy_id)
            .ok_or(Error::PolicyNotFound(policy_id))?;
        let ref_count = self.arena[index].ref_count();
        if ref_count > 0 {
            return Err(Error::PolicyInUse(policy_id, ref_count));
        }
        self.by_id.remove(&policy_id);
        self.arena.remove(index);
        Ok(())
    }

    pub fn get(&self, policy_id: u32) -> Option<Arc<Policy>> {
        self.by_id.get(&policy_id).map(|idx| self.arena[*idx].clone())
    }

    pub(crate) fn incref(&self, policy_id: u32) {
        if let Some(idx) = self.by_id.get(&policy_id) {
            self.arena[*idx].incref();
        }
    }

    pub(crate) fn decref(&self, policy_id: u32) {
        if let Some(idx) = self.by_id.get(&policy_id) {
            self.arena[*idx].decref();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.arena.iter().map(|(_, policy)| policy)
    }
}

/// The optional process-scoped override action: when a packet's FIB result
/// is a default-route adjacency *and* `default_route_action` is active, it
/// overrides the per-Policy action. Published lock-free since the
/// datapath reads it on every packet.
#[derive(Default)]
pub struct DefaultRouteAction(ArcSwapOption<PolicyAction>);

impl DefaultRouteAction {
    pub fn set(&self, action: PolicyAction) {
        self.0.store(Some(Arc::new(action)));
    }

    pub fn clear(&self) {
        self.0.store(None);
    }

    pub fn get(&self) -> Option<Arc<PolicyAction>> {
        self.0.load_full()
    }
}
