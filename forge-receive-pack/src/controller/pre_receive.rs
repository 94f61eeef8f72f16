use crate::classify::{classify, force_flags, Action, ChangedRefs};
use crate::guard::GuardContext;
use crate::hooks::{HookInput, HookOutput};
use crate::interrupt::{or_cancelled, CancellationPoint};
use crate::protection::{is_critical, VerifyInput};
use crate::refs::{RefType, PULLREQ_PREFIX};
use crate::session::PushSession;
use crate::store::{Permission, Principal, RepoState, Repository};
use crate::Error;

use super::{Controller, DEFAULT_BRANCH_ERROR, PROTECTION_ERROR, PULLREQ_REFS_ERROR, SIZE_LIMIT_ERROR, STATE_ERROR};

impl Controller {
    /// Decide about a push. Refusals end up in the output, only failures are returned as errors.
    pub(super) async fn run_pre_receive(&self, session: &PushSession, input: &HookInput) -> Result<HookOutput, Error> {
        let cancel = session.cancel_token();
        let mut out = HookOutput::default();
        for update in &input.ref_updates {
            update.validate()?;
        }

        let repo = self.stores.repos.find(input.repo_id).await?;
        if !input.internal && !matches!(repo.state, RepoState::Active | RepoState::MigrateGitPush) {
            tracing::info!(state = ?repo.state, "push refused in repository state");
            out.reject(STATE_ERROR);
            return Ok(out);
        }

        match self.limiter.check_repo_size(repo.id).await {
            Ok(()) => {}
            Err(Error::LimitExceeded(detail)) => {
                tracing::warn!(repo_id = repo.id, %detail, "repository size limit reached, push refused");
                out.reject(SIZE_LIMIT_ERROR);
                return Ok(out);
            }
            Err(err) => return Err(err),
        }

        cancel.check()?;
        let params = input.read_params(self.server.repo_dir(&repo.git_uid));
        let forced = or_cancelled(cancel, async {
            Ok(force_flags(self.git.as_ref(), &params, &input.ref_updates).await)
        })
        .await?;
        let changes = classify(&input.ref_updates, &forced);

        if changes
            .branches
            .deleted
            .iter()
            .any(|u| u.branch_name() == Some(repo.default_branch.as_str()))
        {
            tracing::info!(branch = %repo.default_branch, "refusing to delete the default branch");
            out.reject(DEFAULT_BRANCH_ERROR);
            return Ok(out);
        }

        if !input.internal
            && repo.state != RepoState::MigrateGitPush
            && changes.other.iter().any(|u| u.name.starts_with(PULLREQ_PREFIX))
        {
            tracing::info!("refusing external update of pull request refs");
            out.reject(PULLREQ_REFS_ERROR);
            return Ok(out);
        }

        let principal = self.stores.principals.find(input.principal_id).await?;
        if !input.internal && repo.state == RepoState::Active {
            self.check_protection_rules(&principal, &repo, &changes, &mut out).await?;
            if out.is_rejected() {
                return Ok(out);
            }
        }

        let ctx = GuardContext {
            repo: &repo,
            principal: &principal,
            input,
            changes: &changes,
            params: &params,
            settings: self.stores.settings.as_ref(),
            defaults: &self.guard_defaults,
        };
        for guard in &self.guards {
            if out.is_rejected() && !guard.is_read_only() {
                tracing::debug!(guard = guard.kind(), "skipping guard with side effects after rejection");
                continue;
            }
            cancel.check()?;
            let guard_out = or_cancelled(cancel, guard.run(ctx)).await?;
            if let Some(error) = &guard_out.error {
                tracing::info!(guard = guard.kind(), %error, "guard rejected push");
            }
            out.absorb(guard_out);
        }
        Ok(out)
    }

    async fn check_protection_rules(
        &self,
        principal: &Principal,
        repo: &Repository,
        changes: &ChangedRefs,
        out: &mut HookOutput,
    ) -> Result<(), Error> {
        let is_repo_owner = self.stores.authz.permitted(principal, repo, Permission::Own).await?;
        let mut violations = Vec::new();
        for action in [Action::Create, Action::Delete, Action::Update, Action::UpdateForce] {
            let names = changes.branch_names(action);
            violations.extend(
                self.protection
                    .verify(&VerifyInput {
                        actor: principal,
                        is_repo_owner,
                        allow_bypass: true,
                        repo,
                        action,
                        ref_type: RefType::Branch,
                        ref_names: &names,
                    })
                    .await?,
            );
        }
        for rule in &violations {
            out.messages(rule.messages());
        }
        if is_critical(&violations) {
            tracing::info!(
                rules = ?violations.iter().filter(|v| v.critical).map(|v| v.identifier.as_str()).collect::<Vec<_>>(),
                "push blocked by protection rules"
            );
            out.reject(PROTECTION_ERROR);
        }
        Ok(())
    }
}
