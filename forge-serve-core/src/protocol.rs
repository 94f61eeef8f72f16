//! Protocol version negotiation through the `Git-Protocol` header (HTTP) or `GIT_PROTOCOL` (SSH).

use crate::service::Error;

/// Supported Git protocol versions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolVersion {
    /// v0 smart protocol
    #[default]
    V0,
    /// v1 smart protocol
    V1,
    /// v2 command-based protocol
    V2,
}

/// A validated `Git-Protocol` value which is safe to hand to git as `GIT_PROTOCOL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitProtocol {
    raw: String,
    version: ProtocolVersion,
}

impl GitProtocol {
    /// Parse the colon separated `key[=value]` list sent by the client.
    ///
    /// Unknown keys are kept so git can decide about them, but anything that could smuggle
    /// additional environment or arguments into the child is refused.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut version = ProtocolVersion::V0;
        for param in value.split(':').filter(|p| !p.is_empty()) {
            let (key, val) = match param.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (param, None),
            };
            let key_ok = !key.is_empty()
                && key
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
            let val_ok = val.map_or(true, |v| v.bytes().all(|b| b.is_ascii_graphic()));
            if !key_ok || !val_ok {
                return Err(Error::InvalidProtocol(value.to_owned()));
            }
            if key == "version" {
                version = match val {
                    Some("1") => ProtocolVersion::V1,
                    Some("2") => ProtocolVersion::V2,
                    _ => ProtocolVersion::V0,
                };
            }
        }
        Ok(GitProtocol {
            raw: value.to_owned(),
            version,
        })
    }

    /// The requested protocol version, v0 if none was requested.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The value to export as `GIT_PROTOCOL`.
    pub fn as_env_value(&self) -> &str {
        &self.raw
    }
}
