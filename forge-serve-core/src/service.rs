//! The git services exposed over the smart protocol.

use std::fmt;
use std::str::FromStr;

/// The error type used by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A generic I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The requested service is not one of the smart services.
    #[error("unsupported service '{0}'")]
    UnsupportedService(String),
    /// A `Git-Protocol` header that we refuse to forward to git.
    #[error("invalid git protocol parameter '{0}'")]
    InvalidProtocol(String),
}

/// The kind of server-side service to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceKind {
    /// Upload-pack: fetch and clone.
    UploadPack,
    /// Receive-pack: push.
    ReceivePack,
}

impl ServiceKind {
    /// The git subcommand implementing this service, e.g. `receive-pack`.
    pub fn subcommand(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "upload-pack",
            ServiceKind::ReceivePack => "receive-pack",
        }
    }

    /// The service name as used on the wire, e.g. `git-receive-pack`.
    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "git-upload-pack",
            ServiceKind::ReceivePack => "git-receive-pack",
        }
    }

    /// Content type of the `info/refs` response.
    pub fn advertisement_content_type(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "application/x-git-upload-pack-advertisement",
            ServiceKind::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type of the expected request body of the service endpoint.
    pub fn request_content_type(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "application/x-git-upload-pack-request",
            ServiceKind::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    /// Content type of the service endpoint response.
    pub fn result_content_type(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "application/x-git-upload-pack-result",
            ServiceKind::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    /// Whether the service writes to the repository.
    pub fn is_write(self) -> bool {
        matches!(self, ServiceKind::ReceivePack)
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    /// Accepts both the wire name (`git-upload-pack`) and the bare subcommand (`upload-pack`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("git-").unwrap_or(s) {
            "upload-pack" => Ok(ServiceKind::UploadPack),
            "receive-pack" => Ok(ServiceKind::ReceivePack),
            _ => Err(Error::UnsupportedService(s.to_owned())),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
