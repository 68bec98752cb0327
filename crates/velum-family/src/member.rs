//! Member classification and the fixed-width record encoding.

use thiserror::Error;
use velum_types::{RelayId, DIGEST_LEN};

/// Result type for family operations.
pub type Result<T> = std::result::Result<T, FamilyError>;

/// Errors raised while canonicalizing a family member list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FamilyError {
    /// A member was neither a legal nickname nor a legal hex fingerprint.
    #[error("invalid family member: {0:?}")]
    InvalidMember(String),
}

/// Each member is encoded as one kind byte plus `DIGEST_LEN` identifier
/// bytes: the raw identity digest for fingerprints, the NUL-padded name
/// for nicknames. Records sort and compare as raw bytes.
pub(crate) const MEMBER_LEN: usize = 1 + DIGEST_LEN;

pub(crate) const KIND_NICKNAME: u8 = 0;
pub(crate) const KIND_FINGERPRINT: u8 = 1;

/// Longest legal nickname. One less than the identifier width, so an
/// encoded nickname always carries at least one NUL terminator.
const MAX_NICKNAME_LEN: usize = DIGEST_LEN - 1;

const HEX_DIGEST_LEN: usize = DIGEST_LEN * 2;

/// A borrowed view of one canonical family record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRef<'a> {
    /// Member named by relay nickname.
    Nickname(&'a str),
    /// Member named by identity digest.
    Fingerprint(RelayId),
}

/// A member reference submitted for a containment query: a relay as the
/// caller knows it, by name and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef<'a> {
    /// The relay's self-chosen nickname, if known.
    pub nickname: Option<&'a str>,
    /// The relay's identity digest.
    pub id: RelayId,
}

/// A resolved relay, as returned by an [`EntityDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// The relay's nickname, if it published one.
    pub nickname: Option<String>,
    /// The relay's identity digest.
    pub id: RelayId,
}

/// Directory collaborator used to resolve canonical records back into
/// live relays.
pub trait EntityDirectory {
    /// Look up a relay by identity digest.
    fn by_fingerprint(&self, id: &RelayId) -> Option<Entity>;
    /// Look up a relay by nickname.
    fn by_nickname(&self, name: &str) -> Option<Entity>;
}

pub(crate) fn is_legal_nickname(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NICKNAME_LEN && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Decode a fingerprint-style member: an optional `$`, 40 hex digits, and
/// an optional `=name` or `~name` suffix (the name part carries no
/// identity and is dropped).
pub(crate) fn decode_hex_digest(s: &str) -> Option<RelayId> {
    let s = s.strip_prefix('$').unwrap_or(s);
    let hex_part = match s.find(['=', '~']) {
        Some(idx) => &s[..idx],
        None => s,
    };
    if hex_part.len() != HEX_DIGEST_LEN {
        return None;
    }
    RelayId::from_hex(hex_part).ok()
}

/// Encode one submitted member string as a fixed-width record.
pub(crate) fn encode_member(s: &str) -> Result<[u8; MEMBER_LEN]> {
    let mut record = [0u8; MEMBER_LEN];
    if is_legal_nickname(s) {
        record[0] = KIND_NICKNAME;
        record[1..1 + s.len()].copy_from_slice(s.as_bytes());
        Ok(record)
    } else if let Some(id) = decode_hex_digest(s) {
        record[0] = KIND_FINGERPRINT;
        record[1..].copy_from_slice(id.as_bytes());
        Ok(record)
    } else {
        Err(FamilyError::InvalidMember(s.to_string()))
    }
}

/// Encode an identity digest as a fingerprint record.
pub(crate) fn encode_fingerprint(id: &RelayId) -> [u8; MEMBER_LEN] {
    let mut record = [0u8; MEMBER_LEN];
    record[0] = KIND_FINGERPRINT;
    record[1..].copy_from_slice(id.as_bytes());
    record
}

/// Decode a canonical record back into a borrowed member view.
pub(crate) fn decode_record(record: &[u8]) -> MemberRef<'_> {
    debug_assert_eq!(record.len(), MEMBER_LEN);
    match record[0] {
        KIND_NICKNAME => {
            let id = &record[1..];
            let end = id.iter().position(|b| *b == 0).unwrap_or(id.len());
            // Encoded nicknames are ASCII by construction.
            let name = std::str::from_utf8(&id[..end]).unwrap_or("");
            MemberRef::Nickname(name)
        }
        _ => {
            let mut bytes = [0u8; DIGEST_LEN];
            bytes.copy_from_slice(&record[1..]);
            MemberRef::Fingerprint(RelayId::from_bytes(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_legality() {
        assert!(is_legal_nickname("Ratatosk"));
        assert!(is_legal_nickname("a"));
        assert!(is_legal_nickname("1234567890123456789")); // 19 chars
        assert!(!is_legal_nickname("12345678901234567890")); // 20 chars
        assert!(!is_legal_nickname(""));
        assert!(!is_legal_nickname("has space"));
        assert!(!is_legal_nickname("dash-ed"));
    }

    #[test]
    fn hex_digest_forms() {
        let hex = "00112233445566778899AABBCCDDEEFF00112233";
        let id = RelayId::from_hex(hex).unwrap();
        assert_eq!(decode_hex_digest(hex), Some(id));
        assert_eq!(decode_hex_digest(&format!("${hex}")), Some(id));
        assert_eq!(decode_hex_digest(&format!("${hex}=SomeName")), Some(id));
        assert_eq!(decode_hex_digest(&format!("${hex}~SomeName")), Some(id));
        assert_eq!(decode_hex_digest("$1234"), None);
        assert_eq!(
            decode_hex_digest("$ZZ112233445566778899AABBCCDDEEFF00112233"),
            None
        );
    }

    #[test]
    fn record_round_trip() {
        let nick = encode_member("Vedfolnir").unwrap();
        assert_eq!(decode_record(&nick), MemberRef::Nickname("Vedfolnir"));

        let hex = "00112233445566778899AABBCCDDEEFF00112233";
        let fp = encode_member(hex).unwrap();
        assert_eq!(
            decode_record(&fp),
            MemberRef::Fingerprint(RelayId::from_hex(hex).unwrap())
        );
    }

    #[test]
    fn bad_member_rejected() {
        assert_eq!(
            encode_member("not legal!"),
            Err(FamilyError::InvalidMember("not legal!".to_string()))
        );
    }
}
