//! forge-serve-core: transport-neutral smart protocol primitives.
//!
//! The push admission pipeline and the fetch path both speak the git smart protocol over
//! HTTP and SSH. The pieces here are what both transports need to agree on before a git
//! child process is spawned: which service is requested, how its responses are labelled,
//! how the `info/refs` advertisement is framed and which client agents are admitted.
//!
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod agent;
pub mod headers;
pub mod pktline;
pub mod protocol;
pub mod service;

pub use agent::ClientAgentPolicy;
pub use protocol::ProtocolVersion;
pub use service::{Error, ServiceKind};
