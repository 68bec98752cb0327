//! Canonical, interned relay-family sets.
//!
//! A relay may declare a "family" of other relays it shares an operator
//! with, naming each member either by nickname or by identity fingerprint.
//! Two relays describing the same family usually submit the member list in
//! different orders, with duplicates, or with themselves included.  This
//! crate canonicalizes every submitted list into a sorted, deduplicated,
//! fixed-width byte encoding and interns the result in a content-addressed
//! table, so equivalent families collapse to one shared allocation and can
//! be compared by handle identity instead of set comparison.
//!
//! # Usage
//!
//! ```
//! use velum_family::FamilyTable;
//!
//! let mut table = FamilyTable::new();
//! let a = table.intern(&["Ratatosk", "Vedfolnir"], None).unwrap();
//! let b = table.intern(&["vedfolnir", "ratatosk", "ratatosk"], None).unwrap();
//! assert!(a.same_family(&b));
//! table.release(a);
//! table.release(b);
//! assert_eq!(table.len(), 0);
//! ```

mod member;
mod table;

pub use member::{Entity, EntityDirectory, EntityRef, FamilyError, MemberRef};
pub use table::{Family, FamilyHandle, FamilyTable};
