//! Admission of client agents on repositories that only accept the dedicated fit client.

/// Decides whether a `User-Agent` (HTTP) or `SSH_USER_AGENT` (SSH) value belongs to an allowed client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAgentPolicy {
    fit_prefix: String,
    pipeline_agent: Option<String>,
}

impl ClientAgentPolicy {
    /// Allow agents starting with `fit_prefix`.
    pub fn new(fit_prefix: impl Into<String>) -> Self {
        Self {
            fit_prefix: fit_prefix.into(),
            pipeline_agent: None,
        }
    }

    /// Additionally allow the exact agent string used by CI pipelines.
    pub fn with_pipeline_agent(mut self, agent: impl Into<String>) -> Self {
        self.pipeline_agent = Some(agent.into());
        self
    }

    /// Returns `true` if `user_agent` may talk to a repository requiring the fit client.
    ///
    /// An empty prefix never matches, so an unconfigured policy refuses every agent.
    pub fn is_allowed(&self, user_agent: Option<&str>) -> bool {
        let Some(agent) = user_agent else { return false };
        if self.pipeline_agent.as_deref() == Some(agent) {
            return true;
        }
        !self.fit_prefix.is_empty() && agent.starts_with(&self.fit_prefix)
    }
}
