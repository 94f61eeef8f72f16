//! The hook handler that decides about pushes and reports what they changed.
//!
//! [`Controller`] implements [`HookHandler`] for the hook server. Pre-receive runs the admission
//! checks and moves the [`PushSession`] to `Accepted` or `Rejected`; update only lets refs through
//! that pre-receive saw; post-receive turns the moved refs into events and terminal hints.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::config::{GuardConfig, PullReqFlow, ServerConfig};
use crate::error::Class;
use crate::events::Reporter;
use crate::git::GitReader;
use crate::guard::secrets::RuleSet;
use crate::guard::{CodeOwnersGuard, Guard, OversizeGuard, SecretScanner};
use crate::hooks::{HookHandler, HookInput, HookOutput, NoopExtender, PostReceiveExtender, PreReceiveExtender};
use crate::limiter::{ResourceLimiter, UnlimitedLimiter};
use crate::protection::{ProtectionEngine, RuleParsers};
use crate::session::{PushSession, PushState};
use crate::store::Stores;
use crate::urls::UrlProvider;
use crate::Error;

mod post_receive;
mod pre_receive;

pub const STATE_ERROR: &str = "Push not allowed in the current repository state";
pub const SIZE_LIMIT_ERROR: &str = "Repository size limit exceeded";
pub const DEFAULT_BRANCH_ERROR: &str = "The default branch of a repository can't be deleted";
pub const PULLREQ_REFS_ERROR: &str = "The pull request references can't be modified.";
pub const PROTECTION_ERROR: &str = "Blocked by protection rules.";
pub const EMPTY_REPO_ERROR: &str = "Pushing to an empty repository requires at least one branch with commits.";

/// The collaborators a [`Controller`] is assembled from.
pub struct Parts {
    pub stores: Stores,
    pub git: Arc<dyn GitReader>,
    pub reporter: Reporter,
    pub limiter: Arc<dyn ResourceLimiter>,
    pub rule_parsers: RuleParsers,
    pub secret_rules: Arc<RuleSet>,
    pub pre_extender: Arc<dyn PreReceiveExtender>,
    pub post_extender: Arc<dyn PostReceiveExtender>,
    pub server: ServerConfig,
    pub guards: GuardConfig,
    pub flow: PullReqFlow,
}

impl Parts {
    /// Parts with builtin rules, no limits and no extenders.
    pub fn new(stores: Stores, git: Arc<dyn GitReader>, reporter: Reporter) -> Result<Self, Error> {
        Ok(Parts {
            stores,
            git,
            reporter,
            limiter: Arc::new(UnlimitedLimiter),
            rule_parsers: RuleParsers::builtin(),
            secret_rules: Arc::new(RuleSet::builtin()?),
            pre_extender: Arc::new(NoopExtender),
            post_extender: Arc::new(NoopExtender),
            server: ServerConfig::default(),
            guards: GuardConfig::default(),
            flow: PullReqFlow::default(),
        })
    }
}

/// Admission decisions and post-push reporting for one server.
pub struct Controller {
    stores: Stores,
    git: Arc<dyn GitReader>,
    protection: ProtectionEngine,
    guards: Vec<Guard>,
    limiter: Arc<dyn ResourceLimiter>,
    reporter: Reporter,
    urls: UrlProvider,
    server: ServerConfig,
    guard_defaults: GuardConfig,
    flow: PullReqFlow,
    post_extender: Arc<dyn PostReceiveExtender>,
}

impl Controller {
    pub fn new(parts: Parts) -> Self {
        let Parts {
            stores,
            git,
            reporter,
            limiter,
            rule_parsers,
            secret_rules,
            pre_extender,
            post_extender,
            server,
            guards,
            flow,
        } = parts;
        let guard_chain = vec![
            Guard::Secrets(SecretScanner::new(git.clone(), secret_rules)),
            Guard::Extender(pre_extender),
            Guard::Oversize(OversizeGuard::new(git.clone())),
            Guard::CodeOwners(CodeOwnersGuard::new(
                git.clone(),
                stores.principals.clone(),
                guards.codeowners_paths.clone(),
            )),
        ];
        Controller {
            protection: ProtectionEngine::new(stores.rules.clone(), rule_parsers),
            urls: UrlProvider::new(server.base_url.clone()),
            stores,
            git,
            guards: guard_chain,
            limiter,
            reporter,
            server,
            guard_defaults: guards,
            flow,
            post_extender,
        }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn urls(&self) -> &UrlProvider {
        &self.urls
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("guards", &self.guards)
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

fn log_failure(hook: &str, err: &Error) {
    match err.class() {
        Class::FatalBug => tracing::error!(hook, error = %err, "hook failed"),
        Class::Transient => tracing::warn!(hook, error = %err, "hook failed"),
        Class::UserRejectable | Class::PolicyViolation => tracing::info!(hook, error = %err, "hook refused"),
    }
}

#[async_trait]
impl HookHandler for Controller {
    async fn pre_receive(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error> {
        let span = tracing::info_span!(
            "pre_receive",
            session = %session.id(),
            repo_id = input.repo_id,
            principal_id = input.principal_id,
            updates = input.ref_updates.len()
        );
        async {
            session.record_input(input);
            let decision = self.run_pre_receive(session, input).await;
            let out = match decision {
                Ok(out) => out,
                Err(err) => {
                    log_failure("pre-receive", &err);
                    session.advance(PushState::Rejected)?;
                    return Err(err);
                }
            };
            session.advance(PushState::Validated)?;
            if out.is_rejected() {
                tracing::info!(error = out.error.as_deref().unwrap_or_default(), "push rejected");
                session.advance(PushState::Rejected)?;
            } else {
                session.advance(PushState::Accepted)?;
            }
            session.append_output(&out);
            Ok(out)
        }
        .instrument(span)
        .await
    }

    async fn update(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error> {
        let mut out = HookOutput::default();
        if session.state() != PushState::Accepted {
            out.reject(format!("Push is not accepted ({:?})", session.state()));
            return Ok(out);
        }
        for update in &input.ref_updates {
            if !session.was_validated(update) {
                tracing::warn!(session = %session.id(), ref_name = %update.name, "update hook saw an unvalidated ref");
                out.reject(format!("Update of {} was not validated", update.name));
            }
        }
        Ok(out)
    }

    async fn post_receive(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error> {
        if session.state() != PushState::Accepted {
            return Err(Error::Forbidden(format!(
                "post-receive for push session {} that was not accepted",
                session.id()
            )));
        }
        let span = tracing::info_span!(
            "post_receive",
            session = %session.id(),
            repo_id = input.repo_id,
            principal_id = input.principal_id
        );
        let out = self.run_post_receive(input).instrument(span).await;
        session.append_output(&out);
        Ok(out)
    }
}
