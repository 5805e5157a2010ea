//! Diff of the remote listing against the cache.

use std::collections::BTreeMap;

use crate::cache::ObjectDescriptor;
use crate::component::ComponentId;

/// Changes on the remote side since the last sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    pub created: Vec<ObjectDescriptor>,
    pub modified: Vec<ObjectDescriptor>,
    pub removed: Vec<ObjectDescriptor>,
    /// Stored and handed back on the next call.
    pub sync_tag: Option<String>,
    /// More changes are pending; ask again with the new tag.
    pub may_need_repeat: bool,
}

impl RemoteChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Compare the full remote listing with what the cache holds.
///
/// Created objects are on the remote only, modified ones are on both
/// sides with a different revision, removed ones are in the cache only.
/// A detached instance missing from the listing is not removed unless its
/// master goes too: remotes commonly list only the master of a series.
/// Each list is sorted, so the result does not depend on input order.
pub fn compute_changes(local: &[ObjectDescriptor], remote: &[ObjectDescriptor]) -> RemoteChanges {
    let local: BTreeMap<ComponentId, &ObjectDescriptor> =
        local.iter().map(|d| (d.id(), d)).collect();

    let mut remote_by_id: BTreeMap<ComponentId, &ObjectDescriptor> = BTreeMap::new();
    for descriptor in remote {
        remote_by_id
            .entry(descriptor.id())
            .and_modify(|seen| {
                // Highest revision wins; equal revisions fall back to `extra`
                if descriptor > *seen {
                    *seen = descriptor;
                }
            })
            .or_insert(descriptor);
    }

    let mut changes = RemoteChanges::default();

    for (id, theirs) in &remote_by_id {
        match local.get(id) {
            None => changes.created.push((*theirs).clone()),
            Some(ours) if ours.revision != theirs.revision => {
                changes.modified.push((*theirs).clone())
            }
            Some(_) => {}
        }
    }

    for (id, ours) in &local {
        if remote_by_id.contains_key(id) {
            continue;
        }
        if id.is_instance() {
            let master = id.to_master();
            let master_removed = local.contains_key(&master) && !remote_by_id.contains_key(&master);
            if !master_removed {
                continue;
            }
        }
        changes.removed.push((*ours).clone());
    }

    changes.created.sort();
    changes.modified.sort();
    changes.removed.sort();
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(uid: &str, rid: Option<&str>, revision: &str) -> ObjectDescriptor {
        ObjectDescriptor::new(uid, rid.map(str::to_string), revision)
    }

    fn uids(list: &[ObjectDescriptor]) -> Vec<&str> {
        list.iter().map(|d| d.uid.as_str()).collect()
    }

    #[test]
    fn test_created_modified_removed() {
        let local = vec![d("1", None, "A")];
        let remote = vec![d("1", None, "B"), d("2", None, "X")];

        let changes = compute_changes(&local, &remote);
        assert_eq!(uids(&changes.modified), vec!["1"]);
        assert_eq!(changes.modified[0].revision, "B");
        assert_eq!(uids(&changes.created), vec!["2"]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_result_ignores_input_order() {
        let local = vec![d("b", None, "1"), d("a", None, "1"), d("z", None, "1")];
        let remote = vec![
            d("d", None, "1"),
            d("a", None, "2"),
            d("c", None, "1"),
            d("b", None, "2"),
        ];

        let expected = compute_changes(&local, &remote);
        assert_eq!(uids(&expected.created), vec!["c", "d"]);
        assert_eq!(uids(&expected.modified), vec!["a", "b"]);
        assert_eq!(uids(&expected.removed), vec!["z"]);

        let mut local_rev = local.clone();
        local_rev.reverse();
        let mut remote_rot = remote.clone();
        remote_rot.rotate_left(2);
        assert_eq!(compute_changes(&local_rev, &remote_rot), expected);
    }

    #[test]
    fn test_detached_instance_survives_while_master_stays() {
        let local = vec![
            d("series", None, "1"),
            d("series", Some("20250101T100000Z"), "1"),
        ];
        let remote = vec![d("series", None, "1")];

        let changes = compute_changes(&local, &remote);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_detached_instance_goes_with_its_master() {
        let local = vec![
            d("series", None, "1"),
            d("series", Some("20250101T100000Z"), "1"),
        ];

        let changes = compute_changes(&local, &[]);
        assert_eq!(changes.removed.len(), 2);
        assert_eq!(changes.removed[0].rid, None, "master sorts first");
    }

    #[test]
    fn test_duplicate_remote_entries_keep_highest_revision() {
        let remote = vec![d("1", None, "3"), d("1", None, "7"), d("1", None, "5")];
        let changes = compute_changes(&[], &remote);
        assert_eq!(changes.created.len(), 1);
        assert_eq!(changes.created[0].revision, "7");
    }

    #[test]
    fn test_duplicate_remote_entries_with_equal_revision_are_order_independent() {
        let a = d("1", None, "7").with_extra("href-a");
        let b = d("1", None, "7").with_extra("href-b");

        let forward = compute_changes(&[], &[a.clone(), b.clone()]);
        let backward = compute_changes(&[], &[b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.created.len(), 1);
        assert_eq!(forward.created[0].extra.as_deref(), Some("href-b"));
    }
}
