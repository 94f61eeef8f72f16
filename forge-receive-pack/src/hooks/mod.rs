//! The hook callback channel between a spawned `git receive-pack` and this server.
//!
//! `receive-pack` runs the `pre-receive`, `update` and `post-receive` hooks, which are shims
//! around the `forge-hook` binary. It posts a [`HookInput`] to the [`server`] and turns the
//! returned [`HookOutput`] into the hook's stderr and exit code:
//!
//! - `pre_receive`: runs once with all updates, before any ref moves
//! - `update`: runs once per ref, right before that ref moves
//! - `post_receive`: runs once after the refs moved
//!
//! # Examples
//!
//! ```rust
//! use forge_receive_pack::hooks::HookOutput;
//!
//! let mut out = HookOutput::default();
//! out.message("Checking push...");
//! assert!(!out.is_rejected());
//!
//! out.reject("Push not allowed in the current repository state");
//! out.reject("a later error never replaces the first one");
//! assert_eq!(out.error.as_deref(), Some("Push not allowed in the current repository state"));
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::ChangedRefs;
use crate::git::ReadParams;
use crate::refs::RefUpdate;
use crate::session::PushSession;
use crate::store::{Principal, Repository};
use crate::Error;

pub mod client;
pub mod env;
pub mod noop;
pub mod scripts;
pub mod server;

pub use noop::NoopExtender;

/// The three hooks `receive-pack` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreReceive,
    Update,
    PostReceive,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [HookKind::PreReceive, HookKind::Update, HookKind::PostReceive];

    /// The hook's file name, which doubles as its callback path segment.
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::PreReceive => "pre-receive",
            HookKind::Update => "update",
            HookKind::PostReceive => "post-receive",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("hook {s:?}")))
    }
}

/// Object directories and push options of the pending push, as seen by the hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Object directories holding the objects of the pending push.
    #[serde(default)]
    pub alternate_object_dirs: Vec<String>,
    /// The `-o`/`--push-option` values of the client.
    #[serde(default)]
    pub git_push_options: Vec<String>,
    /// The quarantine object directory created by `receive-pack`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_object_dir: Option<String>,
}

/// The payload every hook call carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInput {
    pub repo_id: i64,
    pub principal_id: i64,
    /// Pushes made by the server itself skip rules meant for users.
    #[serde(default)]
    pub internal: bool,
    pub ref_updates: Vec<RefUpdate>,
    #[serde(default)]
    pub environment: Environment,
}

impl HookInput {
    /// Read parameters for the repository at `repo_dir` that see the pending push's objects.
    pub fn read_params(&self, repo_dir: impl Into<PathBuf>) -> ReadParams {
        ReadParams::new(repo_dir).with_alternates(self.environment.alternate_object_dirs.iter())
    }
}

/// What a hook call answers: messages for the user's terminal and an optional rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl HookOutput {
    /// Append a message line.
    pub fn message(&mut self, line: impl Into<String>) {
        self.messages.push(line.into());
    }

    /// Append several message lines in order.
    pub fn messages(&mut self, lines: impl IntoIterator<Item = impl Into<String>>) {
        self.messages.extend(lines.into_iter().map(Into::into));
    }

    /// Reject the push with `error`, unless it is rejected already.
    pub fn reject(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }

    /// Append `other`'s messages and adopt its error if none is set yet.
    pub fn absorb(&mut self, other: HookOutput) {
        self.messages.extend(other.messages);
        if let Some(err) = other.error {
            self.reject(err);
        }
    }
}

/// Handles the hook calls of one push session.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn pre_receive(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error>;
    async fn update(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error>;
    async fn post_receive(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error>;
}

/// What extenders get to see of a push.
#[derive(Debug, Clone, Copy)]
pub struct ExtenderContext<'a> {
    pub repo: &'a Repository,
    pub principal: &'a Principal,
    pub input: &'a HookInput,
    pub changes: &'a ChangedRefs,
}

/// A pluggable check that runs after the secret scanner.
#[async_trait]
pub trait PreReceiveExtender: Send + Sync {
    async fn extend(&self, ctx: ExtenderContext<'_>, out: &mut HookOutput) -> Result<(), Error>;

    /// Extenders with side effects are skipped once the push is rejected.
    fn is_read_only(&self) -> bool {
        true
    }
}

/// A pluggable step that runs last in post-receive; its failures are logged and dropped.
#[async_trait]
pub trait PostReceiveExtender: Send + Sync {
    async fn extend(&self, ctx: ExtenderContext<'_>, out: &mut HookOutput) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_format_is_camel_case_and_omits_absent_error() {
        let input: HookInput = serde_json::from_value(serde_json::json!({
            "repoId": 3,
            "principalId": 9,
            "refUpdates": [{
                "ref": "refs/heads/main",
                "old": "0000000000000000000000000000000000000000",
                "new": "1111111111111111111111111111111111111111"
            }],
            "environment": {"alternateObjectDirs": ["/q"], "gitPushOptions": ["ci.skip"]}
        }))
        .unwrap();
        assert!(!input.internal);
        assert_eq!(input.environment.git_push_options, vec!["ci.skip".to_owned()]);
        assert_eq!(input.read_params("/r").alternate_object_dirs, vec![PathBuf::from("/q")]);

        let out = HookOutput {
            error: None,
            messages: vec!["hi".into()],
        };
        assert_eq!(serde_json::to_value(&out).unwrap(), serde_json::json!({"messages": ["hi"]}));
    }

    #[test]
    fn absorb_keeps_first_error_and_order() {
        let mut out = HookOutput::default();
        out.message("a");
        out.reject("first");
        out.absorb(HookOutput {
            error: Some("second".into()),
            messages: vec!["b".into()],
        });
        assert_eq!(out.messages, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(out.error.as_deref(), Some("first"));
    }

    #[test]
    fn hook_kinds_round_trip_their_names() {
        for kind in HookKind::ALL {
            assert_eq!(kind.as_str().parse::<HookKind>().unwrap(), kind);
        }
        assert!("pre-commit".parse::<HookKind>().is_err());
    }
}
