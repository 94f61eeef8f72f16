//! Hook environment management.
//!
//! [`CallbackEnvironment`] builds the variables the server hands to `git receive-pack` so
//! that its hooks can call back. [`HookContext`] is the other end: what the `forge-hook`
//! binary reads from its environment, including the variables `receive-pack` adds itself.

use std::collections::HashMap;

use super::{Environment, HookInput};
use crate::refs::RefUpdate;
use crate::Error;

pub const HOOK_URL: &str = "FORGE_HOOK_URL";
pub const HOOK_TOKEN: &str = "FORGE_HOOK_TOKEN";
pub const REPO_ID: &str = "FORGE_REPO_ID";
pub const PRINCIPAL_ID: &str = "FORGE_PRINCIPAL_ID";
pub const INTERNAL: &str = "FORGE_INTERNAL";
pub const HOOK_LOG: &str = "FORGE_HOOK_LOG";

pub const GIT_OBJECT_DIRECTORY: &str = "GIT_OBJECT_DIRECTORY";
pub const GIT_ALTERNATE_OBJECT_DIRECTORIES: &str = "GIT_ALTERNATE_OBJECT_DIRECTORIES";
pub const GIT_QUARANTINE_PATH: &str = "GIT_QUARANTINE_PATH";
pub const GIT_PUSH_OPTION_COUNT: &str = "GIT_PUSH_OPTION_COUNT";

/// Builder for the variables a spawned `receive-pack` passes on to its hooks.
#[derive(Debug, Clone, Default)]
pub struct CallbackEnvironment {
    hook_url: Option<String>,
    token: Option<String>,
    repo_id: Option<i64>,
    principal_id: Option<i64>,
    internal: bool,
    additional_vars: HashMap<String, String>,
}

impl CallbackEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// The base URL of the hook callback server; without it hooks are not wired.
    pub fn with_hook_url(mut self, url: impl Into<String>) -> Self {
        self.hook_url = Some(url.into());
        self
    }

    /// The bearer token of the push session.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_repo_id(mut self, id: i64) -> Self {
        self.repo_id = Some(id);
        self
    }

    pub fn with_principal_id(mut self, id: i64) -> Self {
        self.principal_id = Some(id);
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_vars.insert(key.into(), value.into());
        self
    }

    /// Build the variable map, failing if a hook URL is set without the session identity.
    pub fn build(self) -> Result<HashMap<String, String>, Error> {
        let mut env = HashMap::new();
        if let Some(url) = self.hook_url {
            let missing = |what: &str| Error::Bug(format!("hook callback configured without {what}"));
            env.insert(HOOK_URL.to_owned(), url);
            env.insert(HOOK_TOKEN.to_owned(), self.token.ok_or_else(|| missing("a session token"))?);
            env.insert(
                REPO_ID.to_owned(),
                self.repo_id.ok_or_else(|| missing("a repository"))?.to_string(),
            );
            env.insert(
                PRINCIPAL_ID.to_owned(),
                self.principal_id.ok_or_else(|| missing("a principal"))?.to_string(),
            );
            env.insert(INTERNAL.to_owned(), self.internal.to_string());
        }
        env.extend(self.additional_vars);
        Ok(env)
    }
}

/// Everything the hook binary learns from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub url: String,
    pub token: String,
    pub repo_id: i64,
    pub principal_id: i64,
    pub internal: bool,
    pub environment: Environment,
}

impl HookContext {
    /// Read the context through `var`, returning `None` if hooks are not wired (`FORGE_HOOK_URL` unset).
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, Error> {
        let Some(url) = var(HOOK_URL).filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let required = |key: &str| var(key).ok_or_else(|| Error::Config(format!("{key} is not set")));
        let number = |key: &str| -> Result<i64, Error> {
            required(key)?
                .parse()
                .map_err(|e| Error::Config(format!("{key} is not a number: {e}")))
        };

        let mut alternate_object_dirs = Vec::new();
        if let Some(dir) = var(GIT_OBJECT_DIRECTORY).filter(|d| !d.is_empty()) {
            alternate_object_dirs.push(dir);
        }
        if let Some(dirs) = var(GIT_ALTERNATE_OBJECT_DIRECTORIES) {
            for dir in std::env::split_paths(&dirs) {
                let dir = dir.to_string_lossy().into_owned();
                if !dir.is_empty() && !alternate_object_dirs.contains(&dir) {
                    alternate_object_dirs.push(dir);
                }
            }
        }

        let option_count: usize = match var(GIT_PUSH_OPTION_COUNT) {
            Some(n) => n
                .parse()
                .map_err(|e| Error::Config(format!("{GIT_PUSH_OPTION_COUNT} is not a number: {e}")))?,
            None => 0,
        };
        let git_push_options = (0..option_count)
            .map(|i| required(&format!("GIT_PUSH_OPTION_{i}")))
            .collect::<Result<_, _>>()?;

        Ok(Some(HookContext {
            url,
            token: required(HOOK_TOKEN)?,
            repo_id: number(REPO_ID)?,
            principal_id: number(PRINCIPAL_ID)?,
            internal: var(INTERNAL).is_some_and(|v| v == "true"),
            environment: Environment {
                alternate_object_dirs,
                git_push_options,
                quarantine_object_dir: var(GIT_QUARANTINE_PATH).filter(|q| !q.is_empty()),
            },
        }))
    }

    /// Read the context from the process environment.
    pub fn from_process_env() -> Result<Option<Self>, Error> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// The payload to post for `ref_updates`.
    pub fn input(&self, ref_updates: Vec<RefUpdate>) -> HookInput {
        HookInput {
            repo_id: self.repo_id,
            principal_id: self.principal_id,
            internal: self.internal,
            ref_updates,
            environment: self.environment.clone(),
        }
    }
}
