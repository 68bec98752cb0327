//! The content-addressed intern table and its refcounted handles.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use velum_types::RelayId;

use crate::member::{
    decode_record, encode_fingerprint, encode_member, Entity, EntityDirectory, EntityRef,
    MemberRef, Result, MEMBER_LEN,
};

/// One interned canonical family: the sorted, deduplicated record blob.
///
/// Immutable once interned; shared between every caller that submitted an
/// equivalent member list.
#[derive(Debug)]
pub struct Family {
    /// Canonical records, `n_members * MEMBER_LEN` bytes, sorted by raw
    /// byte order with exact duplicates collapsed.
    records: Box<[u8]>,
    /// Keyed content hash of `records`; the intern table key.
    digest: [u8; 32],
}

impl Family {
    /// Number of members in the canonical set.
    pub fn n_members(&self) -> usize {
        self.records.len() / MEMBER_LEN
    }

    fn record(&self, i: usize) -> &[u8] {
        &self.records[i * MEMBER_LEN..(i + 1) * MEMBER_LEN]
    }

    /// Iterate the canonical members in sorted order.
    pub fn members(&self) -> impl Iterator<Item = MemberRef<'_>> {
        (0..self.n_members()).map(move |i| decode_record(self.record(i)))
    }
}

/// A shared handle onto an interned [`Family`].
///
/// Handles obtained from equivalent member lists compare equal by pointer
/// identity. Dropping a handle does NOT release its table reference; call
/// [`FamilyTable::release`].
#[derive(Debug, Clone)]
pub struct FamilyHandle(Arc<Family>);

impl FamilyHandle {
    /// Access the interned family.
    pub fn family(&self) -> &Family {
        &self.0
    }

    /// True if both handles refer to the same interned family.
    pub fn same_family(&self, other: &FamilyHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Does the family contain a member with this identity digest?
    pub fn contains_fingerprint(&self, id: &RelayId) -> bool {
        let want = encode_fingerprint(id);
        (0..self.0.n_members()).any(|i| self.0.record(i) == &want[..])
    }

    /// Does the family contain a member with this nickname?
    pub fn contains_nickname(&self, name: &str) -> bool {
        self.0.members().any(|m| match m {
            MemberRef::Nickname(n) => n == name,
            MemberRef::Fingerprint(_) => false,
        })
    }

    /// Does the family contain this relay, by either name or identity?
    pub fn contains_entity(&self, entity: &EntityRef<'_>) -> bool {
        if let Some(name) = entity.nickname {
            if self.contains_nickname(name) {
                return true;
            }
        }
        self.contains_fingerprint(&entity.id)
    }

    /// Resolve every member through the directory. Records no relay is
    /// currently known for are silently skipped.
    pub fn resolve(&self, directory: &dyn EntityDirectory) -> Vec<Entity> {
        self.0
            .members()
            .filter_map(|m| match m {
                MemberRef::Nickname(name) => directory.by_nickname(name),
                MemberRef::Fingerprint(id) => directory.by_fingerprint(&id),
            })
            .collect()
    }

    /// Render the family in canonical order: nicknames verbatim,
    /// fingerprints as `$HEX`, space-joined. Input order and duplicates
    /// are not recoverable from this form.
    pub fn format(&self) -> String {
        let mut parts = Vec::with_capacity(self.0.n_members());
        for m in self.0.members() {
            match m {
                MemberRef::Nickname(name) => parts.push(name.to_string()),
                MemberRef::Fingerprint(id) => parts.push(format!("${}", id.to_hex())),
            }
        }
        parts.join(" ")
    }
}

struct TableEntry {
    family: Arc<Family>,
    refcount: usize,
}

/// The process-scoped intern table for canonical families.
///
/// Keyed by a blake3 hash of the canonical record blob under a table-local
/// random key, so an attacker submitting crafted families cannot force
/// bucket collisions.
pub struct FamilyTable {
    hash_key: [u8; 32],
    entries: HashMap<[u8; 32], TableEntry>,
}

impl FamilyTable {
    /// Create an empty table with a fresh random hash key.
    pub fn new() -> Self {
        Self {
            hash_key: rand::random(),
            entries: HashMap::new(),
        }
    }

    /// Number of distinct interned families.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonicalize `members` (plus the submitting relay's own identity,
    /// if given) and intern the result.
    ///
    /// On a content hit the existing family's refcount is incremented and
    /// the shared handle returned; otherwise the freshly built blob is
    /// inserted with refcount 1. Any illegal member rejects the whole
    /// submission without touching the table.
    pub fn intern<S: AsRef<str>>(
        &mut self,
        members: &[S],
        self_id: Option<&RelayId>,
    ) -> Result<FamilyHandle> {
        let n = members.len() + usize::from(self_id.is_some());
        let mut records: Vec<[u8; MEMBER_LEN]> = Vec::with_capacity(n);
        for m in members {
            records.push(encode_member(m.as_ref())?);
        }
        if let Some(id) = self_id {
            records.push(encode_fingerprint(id));
        }

        // Canonical order, then collapse byte-identical neighbors.
        records.sort_unstable();
        records.dedup();

        let mut blob = Vec::with_capacity(records.len() * MEMBER_LEN);
        for r in &records {
            blob.extend_from_slice(r);
        }
        let digest = *blake3::keyed_hash(&self.hash_key, &blob).as_bytes();

        let entry = self.entries.entry(digest).or_insert_with(|| TableEntry {
            family: Arc::new(Family {
                records: blob.into_boxed_slice(),
                digest,
            }),
            refcount: 0,
        });
        entry.refcount += 1;
        Ok(FamilyHandle(Arc::clone(&entry.family)))
    }

    /// Split `s` on whitespace and intern the resulting member list.
    pub fn parse(&mut self, s: &str, self_id: Option<&RelayId>) -> Result<FamilyHandle> {
        let members: Vec<&str> = s.split_whitespace().collect();
        self.intern(&members, self_id)
    }

    /// Drop one reference to an interned family. When the last reference
    /// is released the family is removed from the table and deallocated.
    pub fn release(&mut self, handle: FamilyHandle) {
        let digest = handle.0.digest;
        match self.entries.get_mut(&digest) {
            Some(entry) => {
                entry.refcount -= 1;
                if entry.refcount == 0 {
                    self.entries.remove(&digest);
                }
            }
            None => {
                // A handle that outlived clear(), or from another table.
                warn!("released a family handle with no table entry");
            }
        }
    }

    /// Forcibly drop every interned family, regardless of outstanding
    /// refcounts. Used at teardown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self::new()
    }
}
