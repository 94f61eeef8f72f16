//! Spawning `git upload-pack` and `git receive-pack` for the smart protocol.

use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use std::sync::Arc;

use forge_serve_core::protocol::GitProtocol;
use forge_serve_core::{pktline, ClientAgentPolicy, ServiceKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::{HookConfig, ServerConfig};
use crate::hooks::env::CallbackEnvironment;
use crate::session::{PushSession, SessionRegistry};
use crate::store::{Authorizer, Permission, Principal, Repository};
use crate::Error;

/// One request for a smart-protocol service.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub repo: Repository,
    /// `None` for anonymous requests.
    pub principal: Option<Principal>,
    pub service: ServiceKind,
    pub user_agent: Option<String>,
    pub protocol: Option<GitProtocol>,
    /// Set for pushes the server makes itself.
    pub internal: bool,
}

/// Runs git services against the repositories under [`ServerConfig::git_root`].
#[derive(Clone)]
pub struct GitInvoker {
    binary: OsString,
    server: ServerConfig,
    hooks: HookConfig,
    agents: ClientAgentPolicy,
    authz: Arc<dyn Authorizer>,
    sessions: SessionRegistry,
}

impl GitInvoker {
    pub fn new(
        server: ServerConfig,
        hooks: HookConfig,
        agents: ClientAgentPolicy,
        authz: Arc<dyn Authorizer>,
        sessions: SessionRegistry,
    ) -> Self {
        GitInvoker {
            binary: OsString::from(&server.git_binary),
            server,
            hooks,
            agents,
            authz,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Fail unless the request may use its service on its repository.
    ///
    /// The client check comes first so that unsupported clients learn about it before being
    /// asked for credentials.
    pub async fn check_access(&self, req: &ServiceRequest) -> Result<(), Error> {
        if req.repo.require_fit_client && !self.agents.is_allowed(req.user_agent.as_deref()) {
            return Err(Error::NotAcceptable(format!(
                "repository {} only accepts the fit client",
                req.repo.path
            )));
        }
        if req.service.is_write() {
            let principal = req.principal.as_ref().ok_or(Error::Unauthorized)?;
            if !self.authz.permitted(principal, &req.repo, Permission::Push).await? {
                return Err(Error::Forbidden(format!("no push access to {}", req.repo.path)));
            }
            if req.repo.mirror {
                return Err(Error::Forbidden(format!("{} is a mirror", req.repo.path)));
            }
        } else if !req.repo.is_public {
            let principal = req.principal.as_ref().ok_or(Error::Unauthorized)?;
            if !self.authz.permitted(principal, &req.repo, Permission::Read).await? {
                return Err(Error::Forbidden(format!("no read access to {}", req.repo.path)));
            }
        }
        Ok(())
    }

    fn command(&self, req: &ServiceRequest, extra: &[&str]) -> tokio::process::Command {
        let repo_dir = self.server.repo_dir(&req.repo.git_uid);
        let mut prepare = gix_command::prepare(self.binary.as_os_str());
        if req.service.is_write() && self.hooks.is_enabled() {
            if let Some(dir) = &self.hooks.dir {
                let mut hooks_path = OsString::from("core.hooksPath=");
                hooks_path.push(dir.as_os_str());
                prepare = prepare.arg("-c").arg(hooks_path);
            }
        }
        prepare = prepare
            .arg(req.service.subcommand())
            .arg("--stateless-rpc")
            .args(extra.iter().copied())
            .arg(repo_dir.as_os_str());
        if let Some(protocol) = &req.protocol {
            prepare = prepare.env("GIT_PROTOCOL", protocol.as_env_value());
        }
        let mut cmd = tokio::process::Command::from(std::process::Command::from(prepare));
        cmd.kill_on_drop(true);
        cmd
    }

    /// The ref advertisement for `GET info/refs`, with the service header unless the client speaks v2.
    pub async fn info_refs(&self, req: &ServiceRequest) -> Result<Vec<u8>, Error> {
        self.check_access(req).await?;
        let mut cmd = self.command(req, &["--advertise-refs"]);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        tracing::debug!(repo_id = req.repo.id, service = %req.service, "advertising refs");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::git(req.service.subcommand(), output.status, &output.stderr));
        }
        let version = req.protocol.as_ref().map(GitProtocol::version).unwrap_or_default();
        let mut body = pktline::advertisement_preamble(req.service, version)?;
        body.extend_from_slice(&output.stdout);
        Ok(body)
    }

    /// Run the service with `stdin` as the client's request and `stdout` receiving git's answer.
    ///
    /// Pushes get a [`PushSession`] registered for the lifetime of the child so its hooks can call
    /// back. Cancelling `cancel` kills git and fails in-flight hook calls.
    pub async fn service_pack<R, W>(
        &self,
        req: &ServiceRequest,
        stdin: R,
        stdout: W,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.check_access(req).await?;
        let mut cmd = self.command(req, &[]);

        let session = match (&req.principal, req.service.is_write()) {
            (Some(principal), true) => Some(self.sessions.open(PushSession::new(
                req.repo.id,
                principal.id,
                req.internal,
                cancel.clone(),
            ))),
            _ => None,
        };
        if let (Some(session), Some(url)) = (&session, &self.hooks.callback_url) {
            let env = CallbackEnvironment::new()
                .with_hook_url(url.clone())
                .with_token(session.token())
                .with_repo_id(req.repo.id)
                .with_principal_id(session.session().principal_id())
                .with_internal(req.internal)
                .build()?;
            cmd.envs(env);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::info!(
            repo_id = req.repo.id,
            service = %req.service,
            session = ?session.as_ref().map(|s| s.session().id()),
            "starting git service"
        );
        let mut child = cmd.spawn()?;
        let missing = |what: &str| Error::Bug(format!("git {what} is not piped"));
        let child_in = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let mut child_out = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let mut child_err = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let feed = async move {
            let (mut stdin, mut child_in) = (stdin, child_in);
            tokio::io::copy(&mut stdin, &mut child_in).await?;
            child_in.shutdown().await
        };
        let drain = async move {
            let mut stdout = stdout;
            tokio::io::copy(&mut child_out, &mut stdout).await?;
            stdout.flush().await
        };
        let collect = async move {
            let mut buf = Vec::new();
            child_err.read_to_end(&mut buf).await.map(|_| buf)
        };
        let run = async {
            let (fed, drained, stderr) = tokio::join!(feed, drain, collect);
            let status = child.wait().await?;
            let stderr = stderr?;
            if !status.success() {
                return Err(Error::git(req.service.subcommand(), status, &stderr));
            }
            if let Err(err) = fed {
                // git may stop reading once it has everything it needs
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
            drained?;
            Ok::<(), Error>(())
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = run => res,
        };
        match &result {
            Ok(()) => tracing::debug!(repo_id = req.repo.id, service = %req.service, "git service finished"),
            Err(Error::Cancelled) => tracing::info!(repo_id = req.repo.id, "client went away, git service killed"),
            Err(err) => tracing::warn!(repo_id = req.repo.id, service = %req.service, error = %err, "git service failed"),
        }
        drop(session);
        result
    }

    pub fn binary(&self) -> &OsStr {
        &self.binary
    }
}

impl std::fmt::Debug for GitInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitInvoker")
            .field("binary", &self.binary)
            .field("git_root", &self.server.git_root)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
