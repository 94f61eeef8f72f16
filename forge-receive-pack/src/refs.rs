//! Ref update commands as reported by `receive-pack` to its hooks.
//!
//! Hooks receive lines of the form `"<old-oid> <new-oid> <refname>"` on stdin.
//! A zero `old` means the ref is created, a zero `new` means it is deleted.
//! Both being zero is invalid.

use gix_hash::ObjectId;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Prefix of branch refs.
pub const BRANCH_PREFIX: &str = "refs/heads/";
/// Prefix of tag refs.
pub const TAG_PREFIX: &str = "refs/tags/";
/// Prefix of server-managed pull request refs.
pub const PULLREQ_PREFIX: &str = "refs/pullreq/";

/// The category of a ref, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    /// `refs/heads/*`
    Branch,
    /// `refs/tags/*`
    Tag,
    /// Everything else, including `refs/pullreq/*`.
    Other,
}

impl RefType {
    /// Classify `name` by prefix.
    pub fn of(name: &str) -> Self {
        if name.starts_with(BRANCH_PREFIX) {
            RefType::Branch
        } else if name.starts_with(TAG_PREFIX) {
            RefType::Tag
        } else {
            RefType::Other
        }
    }
}

/// A single `(ref, old, new)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdate {
    /// The full ref name, like `refs/heads/main`.
    #[serde(rename = "ref")]
    pub name: String,
    /// The tip before the push, null for creations.
    #[serde(with = "hex_oid")]
    pub old: ObjectId,
    /// The tip after the push, null for deletions.
    #[serde(with = "hex_oid")]
    pub new: ObjectId,
}

impl RefUpdate {
    /// Create a validated update, rejecting the case of both ids being null.
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Result<Self, Error> {
        let update = Self {
            name: name.into(),
            old,
            new,
        };
        update.validate()?;
        Ok(update)
    }

    /// Parse one hook stdin line `"<old> <new> <ref>"`.
    pub fn parse_line(line: &str) -> Result<Self, Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidRefUpdate(format!("expected '<old> <new> <ref>', got {line:?}")));
        };
        let old = parse_oid(old)?;
        let new = parse_oid(new)?;
        if name.is_empty() {
            return Err(Error::InvalidRefUpdate("empty ref name".into()));
        }
        Self::new(name, old, new)
    }

    /// Parse all non-empty lines of a hook's stdin.
    pub fn parse_lines(text: &str) -> Result<Vec<Self>, Error> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }

    /// Format as a hook stdin line, without trailing newline.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.old, self.new, self.name)
    }

    /// Fail with [`Error::InvalidRefUpdate`] if both ids are null.
    pub fn validate(&self) -> Result<(), Error> {
        if self.old.is_null() && self.new.is_null() {
            return Err(Error::InvalidRefUpdate(format!(
                "{}: old and new are both the zero id",
                self.name
            )));
        }
        Ok(())
    }

    /// The category of the ref.
    pub fn ref_type(&self) -> RefType {
        RefType::of(&self.name)
    }

    /// True if the ref did not exist before the push.
    pub fn is_create(&self) -> bool {
        self.old.is_null()
    }

    /// True if the ref is removed by the push.
    pub fn is_delete(&self) -> bool {
        self.new.is_null()
    }

    /// The short branch name, if this is a branch ref.
    pub fn branch_name(&self) -> Option<&str> {
        self.name.strip_prefix(BRANCH_PREFIX)
    }
}

/// The null id in the hash kind used by repositories of this forge.
pub fn null_id() -> ObjectId {
    ObjectId::null(gix_hash::Kind::Sha1)
}

fn parse_oid(hex: &str) -> Result<ObjectId, Error> {
    ObjectId::from_hex(hex.as_bytes()).map_err(|e| Error::InvalidRefUpdate(format!("invalid object id {hex:?}: {e}")))
}

pub(crate) mod hex_oid {
    use gix_hash::ObjectId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &ObjectId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ObjectId, D::Error> {
        let hex = String::deserialize(d)?;
        ObjectId::from_hex(hex.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: &str = "1111111111111111111111111111111111111111";
    const Z: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn parse_create_update_delete() {
        let text = format!("{Z} {A} refs/heads/main\n{A} {Z} refs/tags/v1\n");
        let updates = RefUpdate::parse_lines(&text).unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].is_create());
        assert_eq!(updates[0].branch_name(), Some("main"));
        assert!(updates[1].is_delete());
        assert_eq!(updates[1].ref_type(), RefType::Tag);
        assert_eq!(updates[1].to_line(), format!("{A} {Z} refs/tags/v1"));
    }

    #[test]
    fn both_zero_is_rejected() {
        let err = RefUpdate::parse_line(&format!("{Z} {Z} refs/heads/main")).unwrap_err();
        assert!(matches!(err, Error::InvalidRefUpdate(_)));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(RefUpdate::parse_line("garbage").is_err());
        assert!(RefUpdate::parse_line(&format!("{A} nothex refs/heads/x")).is_err());
    }

    #[test]
    fn ref_types_by_prefix() {
        assert_eq!(RefType::of("refs/heads/a/b"), RefType::Branch);
        assert_eq!(RefType::of("refs/tags/v1"), RefType::Tag);
        assert_eq!(RefType::of("refs/pullreq/1/head"), RefType::Other);
        assert_eq!(RefType::of("refs/notes/commits"), RefType::Other);
    }

    #[test]
    fn json_uses_hex_ids_and_ref_key() {
        let u = RefUpdate::parse_line(&format!("{Z} {A} refs/heads/main")).unwrap();
        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(json, serde_json::json!({"ref": "refs/heads/main", "old": Z, "new": A}));
        let back: RefUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back, u);
    }
}
