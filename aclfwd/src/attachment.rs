//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Attachment Store: binds a Policy to an RX interface at a priority.
//! Per-(interface, family) lists are published through `arc_swap::ArcSwap`
//! so the datapath never locks to read the list it matches against.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::Error;
use crate::link::Family;
use crate::policy::{Policy, PolicyStore};

/// One entry in a per-interface attachment list. The position of a
/// matching ACL rule in the interface's compiled rule set is the index
/// into this same list.
///
/// Carries an `Arc<Policy>` snapshot taken at `attach` time so the datapath
/// can read the policy's action and counters straight off this entry
/// without ever touching `PolicyStore`'s arena or its control-plane mutex
/// (see the note on [`PolicyStore`]).
#[derive(Clone, Debug)]
pub struct AttachmentEntry {
    pub policy_id: u32,
    pub acl_id_cached: u32,
    pub policy: Arc<Policy>,
    pub rx_interface: u32,
    pub family: Family,
    pub priority: u32,
}

#[derive(Eq, Hash, PartialEq)]
struct Key {
    rx_interface: u32,
    family: Family,
}

pub struct AttachmentStore {
    lists: HashMap<Key, ArcSwap<Vec<AttachmentEntry>>>,
}

impl Default for AttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentStore {
    pub fn new() -> Self {
        AttachmentStore {
            lists: HashMap::new(),
        }
    }

    /// Returns the published attachment list for `(rx_interface, family)`,
    /// the datapath's lock-free read path. An interface with no
    /// attachments has no entry at all — a missing key and an empty list
    /// are equivalent to callers.
    pub fn get(
        &self,
        rx_interface: u32,
        family: Family,
    ) -> Option<Arc<Vec<AttachmentEntry>>> {
        self.lists
            .get(&Key {
                rx_interface,
                family,
            })
            .map(|list| list.load_full())
    }

    /// Whether the datapath feature node should run for this interface:
    /// true once the first attachment lands, false once the list empties.
    pub fn feature_enabled(&self, rx_interface: u32, family: Family) -> bool {
        self.get(rx_interface, family)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    pub fn attach(
        &mut self,
        policies: &PolicyStore,
        policy_id: u32,
        rx_interface: u32,
        family: Family,
        priority: u32,
    ) -> Result<(), Error> {
        let policy = policies
            .get(policy_id)
            .ok_or(Error::PolicyNotFound(policy_id))?;
        let key = Key {
            rx_interface,
            family,
        };
        let current = self
            .lists
            .entry(key)
            .or_insert_with(|| ArcSwap::from_pointee(Vec::new()));
        let mut entries = (**current.load()).clone();
        if entries
            .iter()
            .any(|entry| entry.policy_id == policy_id)
        {
            return Err(Error::AttachmentExists(policy_id, rx_interface));
        }

        entries.push(AttachmentEntry {
            policy_id,
            acl_id_cached: policy.acl_id,
            policy,
            rx_interface,
            family,
            priority,
        });
        entries.sort_by_key(|entry| entry.priority);
        current.store(Arc::new(entries));

        policies.incref(policy_id);
        Ok(())
    }

    pub fn detach(
        &mut self,
        policies: &PolicyStore,
        policy_id: u32,
        rx_interface: u32,
        family: Family,
    ) -> Result<(), Error> {
        let key = Key {
            rx_interface,
            family,
        };
        let Some(current) = self.lists.get(&key) else {
            return Err(Error::AttachmentNotFound(policy_id, rx_interface));
        };

        let mut entries = (**current.load()).clone();
        let before = entries.len();
        entries.retain(|entry| entry.policy_id != policy_id);
        if entries.len() == before {
            return Err(Error::AttachmentNotFound(policy_id, rx_interface));
        }
        current.store(Arc::new(entries));
        policies.decref(policy_id);
        Ok(())
    }

    pub fn dump(&self) -> Vec<AttachmentEntry> {
        self.lists
            .values()
            .flat_map(|list| (*list.load_full()).clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Fallback, Group, PolicyAction, Selection};

    fn store_with_policies(ids: &[u32]) -> PolicyStore {
        let mut policies = PolicyStore::new();
        for &id in ids {
            let action = PolicyAction::new(
                Fallback::DefaultRoute,
                Selection::Ordered,
                vec![Group::new(Selection::Ordered, vec![10])],
            );
            policies.policy_add(id, id * 100, action).unwrap();
        }
        policies
    }

    #[test]
    fn priority_ordering() {
        let policies = store_with_policies(&[1, 2]);
        let mut attachments = AttachmentStore::new();
        attachments
            .attach(&policies, 2, 5, Family::V4, 20)
            .unwrap();
        attachments
            .attach(&policies, 1, 5, Family::V4, 10)
            .unwrap();

        let list = attachments.get(5, Family::V4).unwrap();
        assert_eq!(list[0].policy_id, 1);
        assert_eq!(list[1].policy_id, 2);
    }

    #[test]
    fn detach_decrefs_and_removes() {
        let policies = store_with_policies(&[1]);
        let mut attachments = AttachmentStore::new();
        attachments
            .attach(&policies, 1, 5, Family::V4, 10)
            .unwrap();
        assert_eq!(policies.get(1).unwrap().ref_count(), 1);

        attachments.detach(&policies, 1, 5, Family::V4).unwrap();
        assert_eq!(policies.get(1).unwrap().ref_count(), 0);
        assert!(attachments.get(5, Family::V4).unwrap().is_empty());
    }

    #[test]
    fn detach_unknown_errors() {
        let policies = store_with_policies(&[]);
        let mut attachments = AttachmentStore::new();
        let err = attachments.detach(&policies, 1, 5, Family::V4).unwrap_err();
        assert!(matches!(err, Error::AttachmentNotFound(1, 5)));
    }

    #[test]
    fn feature_enable_tracks_list_occupancy() {
        let policies = store_with_policies(&[1]);
        let mut attachments = AttachmentStore::new();
        assert!(!attachments.feature_enabled(5, Family::V4));
        attachments
            .attach(&policies, 1, 5, Family::V4, 10)
            .unwrap();
        assert!(attachments.feature_enabled(5, Family::V4));
        attachments.detach(&policies, 1, 5, Family::V4).unwrap();
        assert!(!attachments.feature_enabled(5, Family::V4));
    }
}
