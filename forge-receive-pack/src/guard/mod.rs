//! Content guards: checks over the objects a push brings along.
//!
//! Each guard reads the pending objects through the quarantine and alternate object
//! directories and reports through a [`HookOutput`]. They run in a fixed order:
//!
//! 1. [`Guard::Secrets`]
//! 2. [`Guard::Extender`]
//! 3. [`Guard::Oversize`]
//! 4. [`Guard::CodeOwners`]
//!
//! Guards never write anything, so all of them run even after one rejected the push and the
//! user sees every problem at once. An extender may declare itself as having side effects, in
//! which case it is skipped once the push is rejected.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::classify::ChangedRefs;
use crate::config::GuardConfig;
use crate::git::ReadParams;
use crate::hooks::{ExtenderContext, HookInput, HookOutput, PreReceiveExtender};
use crate::store::{repo_bool, repo_i64, settings, Principal, Repository, SettingsStore};
use crate::Error;

pub mod codeowners;
pub mod oversize;
pub mod print;
pub mod secrets;

pub use codeowners::CodeOwnersGuard;
pub use oversize::{AlternatesExclusion, OversizeGuard};
pub use secrets::SecretScanner;

pub const SECRETS_ERROR: &str = "Changes blocked by security scan results";
pub const OVERSIZE_ERROR: &str = "Changes blocked by files exceeding the file size limit";
pub const CODEOWNERS_ERROR: &str = "Push is denied by CODEOWNERS rule";

/// Everything a guard may look at.
#[derive(Clone, Copy)]
pub struct GuardContext<'a> {
    pub repo: &'a Repository,
    pub principal: &'a Principal,
    pub input: &'a HookInput,
    pub changes: &'a ChangedRefs,
    pub params: &'a ReadParams,
    pub settings: &'a dyn SettingsStore,
    /// Instance defaults for repositories without their own settings.
    pub defaults: &'a GuardConfig,
}

/// A content guard, dispatched by kind.
#[derive(Clone)]
pub enum Guard {
    Secrets(SecretScanner),
    Extender(Arc<dyn PreReceiveExtender>),
    Oversize(OversizeGuard),
    CodeOwners(CodeOwnersGuard),
}

impl Guard {
    pub fn kind(&self) -> &'static str {
        match self {
            Guard::Secrets(_) => "secrets",
            Guard::Extender(_) => "extender",
            Guard::Oversize(_) => "oversize",
            Guard::CodeOwners(_) => "codeowners",
        }
    }

    /// True unless the guard changes state outside of its output.
    pub fn is_read_only(&self) -> bool {
        match self {
            Guard::Extender(ext) => ext.is_read_only(),
            Guard::Secrets(_) | Guard::Oversize(_) | Guard::CodeOwners(_) => true,
        }
    }

    pub async fn run(&self, ctx: GuardContext<'_>) -> Result<HookOutput, Error> {
        let mut out = HookOutput::default();
        match self {
            Guard::Secrets(scanner) => secrets(scanner, ctx, &mut out).await?,
            Guard::Extender(ext) => {
                let ext_ctx = ExtenderContext {
                    repo: ctx.repo,
                    principal: ctx.principal,
                    input: ctx.input,
                    changes: ctx.changes,
                };
                ext.extend(ext_ctx, &mut out).await?;
            }
            Guard::Oversize(guard) => oversize(guard, ctx, &mut out).await?,
            Guard::CodeOwners(guard) => codeowners(guard, ctx, &mut out).await?,
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Guard").field(&self.kind()).finish()
    }
}

async fn secrets(scanner: &SecretScanner, ctx: GuardContext<'_>, out: &mut HookOutput) -> Result<(), Error> {
    let enabled = repo_bool(
        ctx.settings,
        ctx.repo.id,
        settings::SECRET_SCANNING_ENABLED,
        ctx.defaults.secret_scanning_enabled,
    )
    .await?;
    if !enabled {
        return Ok(());
    }
    let started = Instant::now();
    let findings = scanner.scan(ctx.params, &ctx.input.ref_updates).await?;
    print::secret_findings(out, &findings, ctx.input.ref_updates.len() > 1, started.elapsed());
    if !findings.is_empty() {
        tracing::info!(repo_id = ctx.repo.id, findings = findings.len(), "secrets found in push");
        out.reject(SECRETS_ERROR);
    }
    Ok(())
}

async fn oversize(guard: &OversizeGuard, ctx: GuardContext<'_>, out: &mut HookOutput) -> Result<(), Error> {
    let Some(quarantine) = ctx.input.environment.quarantine_object_dir.as_deref() else {
        return Ok(());
    };
    let limit = repo_i64(ctx.settings, ctx.repo.id, settings::FILE_SIZE_LIMIT, ctx.defaults.file_size_limit).await?;
    let files = guard.find(ctx.params, &[PathBuf::from(quarantine)], limit).await?;
    if !files.is_empty() {
        print::oversize_files(out, &files, limit);
        tracing::info!(repo_id = ctx.repo.id, files = files.len(), limit, "push contains oversize files");
        out.reject(OVERSIZE_ERROR);
    }
    Ok(())
}

async fn codeowners(guard: &CodeOwnersGuard, ctx: GuardContext<'_>, out: &mut HookOutput) -> Result<(), Error> {
    if ctx.input.internal {
        return Ok(());
    }
    let enabled = repo_bool(
        ctx.settings,
        ctx.repo.id,
        settings::CODEOWNERS_ENABLED,
        ctx.defaults.codeowners_enabled,
    )
    .await?;
    if !enabled {
        return Ok(());
    }
    let updates: Vec<_> = ctx
        .changes
        .branches
        .updated
        .iter()
        .chain(&ctx.changes.branches.forced)
        .cloned()
        .collect();
    if updates.is_empty() {
        return Ok(());
    }
    let eval = guard.evaluate(ctx.params, ctx.principal.id, &updates).await?;
    out.messages(eval.warnings.iter().cloned());
    if !eval.denied.is_empty() {
        print::codeowners_denial(out, &eval.denied_patterns());
        tracing::info!(repo_id = ctx.repo.id, principal_id = ctx.principal.id, "push denied by CODEOWNERS");
        out.reject(CODEOWNERS_ERROR);
    }
    Ok(())
}
