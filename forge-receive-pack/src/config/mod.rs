//! Configuration of the push pipeline, read from a git-config formatted file.
//!
//! # Configuration Keys
//!
//! ## Server
//! - `server.gitRoot`: directory holding the repositories by git uid
//! - `server.gitBinary`: the git executable (default `git`)
//! - `server.baseUrl`: root of the web UI, used for pull request links
//! - `server.apiHost`: realm of the basic auth challenge
//! - `server.instanceId`: source id stamped on published events
//!
//! ## Hooks
//! See [`HookConfig`].
//!
//! ## Limits
//! - `limits.maxRepoSize`: bytes, 0 for unlimited
//! - `limits.maxReposPerSpace`: 0 for unlimited
//! - `limits.sizeCacheTtl`: seconds a cached repository size stays fresh (default 60)
//!
//! ## Guards
//! See [`GuardConfig`].
//!
//! ## Pull requests, clients, events and AI review
//! - `pullreq.flow`: `github` (default) or `zentao`
//! - `client.fitPrefix`, `client.pipelineAgent`: admitted user agents for repositories that
//!   require the fit client
//! - `events.path`: JSON lines event stream, in memory if unset
//! - `events.workers`: concurrent deliveries of the dispatcher (default 4)
//! - `events.maxAttempts`: delivery attempts before a record is dead-lettered (default 3)
//! - `ai.reviewTimeout`: seconds (default 30)
//! - `ai.maxCommentLength`: characters (default 65536)

use std::path::PathBuf;
use std::time::Duration;

use gix_config::File;

use crate::Error;

pub mod guards;
pub mod hooks;

pub use guards::GuardConfig;
pub use hooks::HookConfig;

/// Result type for configuration parsing operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub git_root: PathBuf,
    pub git_binary: String,
    pub base_url: String,
    pub api_host: String,
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            git_root: PathBuf::from("repos"),
            git_binary: "git".into(),
            base_url: "http://localhost:3000".into(),
            api_host: "localhost".into(),
            instance_id: "forge".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let mut server = Self::default();
        if let Some(root) = string(config, "server.gitRoot") {
            server.git_root = root.into();
        }
        if let Some(binary) = string(config, "server.gitBinary") {
            server.git_binary = binary;
        }
        if let Some(url) = string(config, "server.baseUrl") {
            server.base_url = url.trim_end_matches('/').to_owned();
        }
        if let Some(host) = string(config, "server.apiHost") {
            server.api_host = host;
        }
        if let Some(id) = string(config, "server.instanceId") {
            server.instance_id = id;
        }
        Ok(server)
    }

    /// The on-disk directory of the repository with `git_uid`.
    pub fn repo_dir(&self, git_uid: &str) -> PathBuf {
        self.git_root.join(format!("{git_uid}.git"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Bytes, zero for no limit.
    pub max_repo_size: u64,
    /// Zero for no limit.
    pub max_repos_per_space: u64,
    pub size_cache_ttl: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_repo_size: 0,
            max_repos_per_space: 0,
            size_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl LimitsConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let mut limits = Self::default();
        if let Some(v) = integer(config, "limits.maxRepoSize")? {
            limits.max_repo_size = non_negative(v, "limits.maxRepoSize")?;
        }
        if let Some(v) = integer(config, "limits.maxReposPerSpace")? {
            limits.max_repos_per_space = non_negative(v, "limits.maxReposPerSpace")?;
        }
        if let Some(v) = integer(config, "limits.sizeCacheTtl")? {
            limits.size_cache_ttl = Duration::from_secs(non_negative(v, "limits.sizeCacheTtl")?);
        }
        Ok(limits)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_repo_size == 0 && self.max_repos_per_space == 0
    }
}

/// How pushed branches relate to pull requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullReqFlow {
    #[default]
    Github,
    /// Branches are opened through the project tracker together with their pull request,
    /// which then announces the branch itself.
    Zentao,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReqConfig {
    pub flow: PullReqFlow,
}

impl PullReqConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let flow = match string(config, "pullreq.flow").as_deref() {
            None | Some("github") => PullReqFlow::Github,
            Some("zentao") => PullReqFlow::Zentao,
            Some(other) => {
                return Err(Error::Config(format!(
                    "'pullreq.flow' must be 'github' or 'zentao', got: {other}"
                )))
            }
        };
        Ok(PullReqConfig { flow })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub fit_prefix: String,
    pub pipeline_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            fit_prefix: "git-fit/".into(),
            pipeline_agent: None,
        }
    }
}

impl ClientConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let mut client = Self::default();
        if let Some(prefix) = string(config, "client.fitPrefix") {
            client.fit_prefix = prefix;
        }
        client.pipeline_agent = string(config, "client.pipelineAgent");
        Ok(client)
    }

    pub fn agent_policy(&self) -> forge_serve_core::ClientAgentPolicy {
        let policy = forge_serve_core::ClientAgentPolicy::new(self.fit_prefix.clone());
        match &self.pipeline_agent {
            Some(agent) => policy.with_pipeline_agent(agent.clone()),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsConfig {
    pub path: Option<PathBuf>,
    pub workers: usize,
    pub max_attempts: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            path: None,
            workers: 4,
            max_attempts: 3,
        }
    }
}

impl EventsConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let mut events = Self::default();
        events.path = string(config, "events.path").map(PathBuf::from);
        if let Some(v) = integer(config, "events.workers")? {
            events.workers = positive(v, "events.workers")? as usize;
        }
        if let Some(v) = integer(config, "events.maxAttempts")? {
            events.max_attempts = positive(v, "events.maxAttempts")? as u32;
        }
        Ok(events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiConfig {
    pub review_timeout: Duration,
    pub max_comment_length: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            review_timeout: Duration::from_secs(30),
            max_comment_length: 65536,
        }
    }
}

impl AiConfig {
    pub fn from_config(config: &File<'_>) -> Result<Self> {
        let mut ai = Self::default();
        if let Some(v) = integer(config, "ai.reviewTimeout")? {
            ai.review_timeout = Duration::from_secs(positive(v, "ai.reviewTimeout")?);
        }
        if let Some(v) = integer(config, "ai.maxCommentLength")? {
            ai.max_comment_length = positive(v, "ai.maxCommentLength")? as usize;
        }
        Ok(ai)
    }
}

/// The complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub hooks: HookConfig,
    pub limits: LimitsConfig,
    pub guards: GuardConfig,
    pub pullreq: PullReqConfig,
    pub client: ClientConfig,
    pub events: EventsConfig,
    pub ai: AiConfig,
}

/// Load all configuration sections from a git config snapshot.
pub fn load_all_config(config: &File<'_>) -> Result<Config> {
    Ok(Config {
        server: ServerConfig::from_config(config)?,
        hooks: HookConfig::from_config(config)?,
        limits: LimitsConfig::from_config(config)?,
        guards: GuardConfig::from_config(config)?,
        pullreq: PullReqConfig::from_config(config)?,
        client: ClientConfig::from_config(config)?,
        events: EventsConfig::from_config(config)?,
        ai: AiConfig::from_config(config)?,
    })
}

/// Parse `text` and load all configuration sections from it.
pub fn from_str(text: &str) -> Result<Config> {
    let file = File::try_from(text).map_err(|e| Error::Config(e.to_string()))?;
    load_all_config(&file)
}

pub(crate) fn string(config: &File<'_>, key: &str) -> Option<String> {
    config.string(key).map(|v| v.to_string())
}

pub(crate) fn strings(config: &File<'_>, key: &str) -> Vec<String> {
    config
        .strings(key)
        .map(|values| values.into_iter().map(|v| v.to_string()).collect())
        .unwrap_or_default()
}

pub(crate) fn integer(config: &File<'_>, key: &str) -> Result<Option<i64>> {
    config
        .integer(key)
        .transpose()
        .map_err(|e| Error::Config(format!("invalid integer value for '{key}': {e}")))
}

pub(crate) fn boolean(config: &File<'_>, key: &str) -> Result<Option<bool>> {
    config
        .boolean(key)
        .transpose()
        .map_err(|e| Error::Config(format!("invalid boolean value for '{key}': {e}")))
}

fn non_negative(value: i64, key: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Config(format!("value for '{key}' must be non-negative, got: {value}")))
}

fn positive(value: i64, key: &str) -> Result<u64> {
    match non_negative(value, key)? {
        0 => Err(Error::Config(format!("value for '{key}' must be positive, got: 0"))),
        v => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_without_any_sections() {
        let config = from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.limits.is_unlimited());
        assert_eq!(config.events.workers, 4);
        assert_eq!(config.ai.review_timeout, Duration::from_secs(30));
    }

    #[test]
    fn all_sections() {
        let config = from_str(
            "[server]\n\tgitRoot = /srv/git\n\tbaseUrl = https://forge.example.com/\n\tapiHost = api.example.com\n\
             [limits]\n\tmaxRepoSize = 1024\n\tsizeCacheTtl = 5\n\
             [pullreq]\n\tflow = zentao\n\
             [client]\n\tfitPrefix = git-fit/\n\tpipelineAgent = forge-ci\n\
             [events]\n\tpath = /var/lib/forge/events.jsonl\n\tworkers = 2\n\tmaxAttempts = 5\n\
             [ai]\n\treviewTimeout = 10\n\tmaxCommentLength = 100\n",
        )
        .unwrap();
        assert_eq!(config.server.git_root, PathBuf::from("/srv/git"));
        assert_eq!(config.server.base_url, "https://forge.example.com");
        assert_eq!(config.server.repo_dir("abc"), PathBuf::from("/srv/git/abc.git"));
        assert_eq!(config.limits.max_repo_size, 1024);
        assert_eq!(config.limits.size_cache_ttl, Duration::from_secs(5));
        assert_eq!(config.pullreq.flow, PullReqFlow::Zentao);
        assert_eq!(config.client.pipeline_agent.as_deref(), Some("forge-ci"));
        assert_eq!(config.events.path, Some(PathBuf::from("/var/lib/forge/events.jsonl")));
        assert_eq!(config.events.max_attempts, 5);
        assert_eq!(config.ai.max_comment_length, 100);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = from_str("[limits]\n\tmaxRepoSize = -1\n").unwrap_err();
        assert!(err.to_string().contains("must be non-negative"));
        assert!(matches!(from_str("[events]\n\tworkers = 0\n"), Err(Error::Config(_))));
        assert!(matches!(from_str("[pullreq]\n\tflow = gitlab\n"), Err(Error::Config(_))));
        assert!(matches!(from_str("[limits]\n\tmaxRepoSize = lots\n"), Err(Error::Config(_))));
    }
}
