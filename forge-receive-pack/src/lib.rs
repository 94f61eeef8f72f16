/*!
Push admission pipeline for a git forge.

A push arrives over smart HTTP, is handed to a spawned `git receive-pack`, and every ref
update it carries passes through the server-side hooks before git moves a ref:

- `pre-receive` runs repository state and size checks, protection rules and content guards
  (secret scanning, file size, CODEOWNERS) and decides about the whole push.
- `update` lets through only refs that `pre-receive` saw.
- `post-receive` promotes the first branch of an empty repository, publishes ref events
  and prints pull request hints.

The hooks are shims around the `forge-hook` binary, which calls back into the server that
spawned git. [`Pipeline`] wires all of this together from a [`Config`] and a set of stores.

Design principles
- Zero I/O in constructors and configuration APIs, all of it happens in [`PipelineBuilder::build`].
- Typestate to make a pipeline without stores impossible to build.
- Refusals are hook output, failures are errors; see [`Class`].
*/

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ai;
pub mod classify;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod git;
pub mod guard;
pub mod hooks;
pub mod http;
pub mod interrupt;
pub mod limiter;
pub mod protection;
pub mod pullreq;
pub mod refs;
pub mod session;
pub mod store;
pub mod trace;
pub mod urls;

pub use config::Config;
pub use error::{with_retry, Class, Error, Kind, RetryStrategy};

use core::marker::PhantomData;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ai::{AiReviewExtender, ReviewProvider, ReviewSink};
use controller::{Controller, Parts};
use events::{Dispatcher, EventStream, FileOffsets, FileStream, MemoryOffsets, MemoryStream, OffsetStore, Reporter};
use git::cli::GitCli;
use git::invoker::GitInvoker;
use git::GitReader;
use guard::secrets::RuleSet;
use hooks::{PostReceiveExtender, PreReceiveExtender};
use limiter::{QuotaLimiter, ResourceLimiter, UnlimitedLimiter};
use pullreq::{PullReqService, SourceBranchFollower};
use session::SessionRegistry;
use store::Stores;

/// Typestates representing builder progress.
pub mod state {
    /// Only configuration is known.
    pub struct Start;
    /// Stores are attached, the pipeline can be built.
    pub struct Ready;
}

/// Builder for a [`Pipeline`] with typestate guarantees.
pub struct PipelineBuilder<S = state::Start> {
    config: Config,
    stores: Option<Stores>,
    git: Option<Arc<dyn GitReader>>,
    stream: Option<Arc<dyn EventStream>>,
    offsets: Option<Arc<dyn OffsetStore>>,
    limiter: Option<Arc<dyn ResourceLimiter>>,
    secret_rules: Option<Arc<RuleSet>>,
    pre_extender: Option<Arc<dyn PreReceiveExtender>>,
    post_extender: Option<Arc<dyn PostReceiveExtender>>,
    review: Option<(Arc<dyn ReviewProvider>, Arc<dyn ReviewSink>)>,
    install_hooks: bool,
    _state: PhantomData<S>,
}

impl PipelineBuilder<state::Start> {
    pub fn new(config: Config) -> Self {
        PipelineBuilder {
            config,
            stores: None,
            git: None,
            stream: None,
            offsets: None,
            limiter: None,
            secret_rules: None,
            pre_extender: None,
            post_extender: None,
            review: None,
            install_hooks: true,
            _state: PhantomData,
        }
    }

    /// Attach the persistence layer and move to the Ready state.
    pub fn with_stores(self, stores: Stores) -> PipelineBuilder<state::Ready> {
        PipelineBuilder {
            config: self.config,
            stores: Some(stores),
            git: self.git,
            stream: self.stream,
            offsets: self.offsets,
            limiter: self.limiter,
            secret_rules: self.secret_rules,
            pre_extender: self.pre_extender,
            post_extender: self.post_extender,
            review: self.review,
            install_hooks: self.install_hooks,
            _state: PhantomData,
        }
    }
}

impl<S> PipelineBuilder<S> {
    /// Read repositories through `git` instead of the configured git binary.
    pub fn with_git(mut self, git: Arc<dyn GitReader>) -> Self {
        self.git = Some(git);
        self
    }

    /// Publish to `stream` instead of the one `[events] path` selects.
    pub fn with_event_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_offsets(mut self, offsets: Arc<dyn OffsetStore>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn ResourceLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_secret_rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.secret_rules = Some(rules);
        self
    }

    pub fn with_pre_receive_extender(mut self, extender: Arc<dyn PreReceiveExtender>) -> Self {
        self.pre_extender = Some(extender);
        self
    }

    pub fn with_post_receive_extender(mut self, extender: Arc<dyn PostReceiveExtender>) -> Self {
        self.post_extender = Some(extender);
        self
    }

    /// Review pushes to pull request source branches with `provider` and post the result to `sink`.
    ///
    /// Ignored when an explicit post-receive extender is set.
    pub fn with_ai_review(mut self, provider: Arc<dyn ReviewProvider>, sink: Arc<dyn ReviewSink>) -> Self {
        self.review = Some((provider, sink));
        self
    }

    /// Whether [`PipelineBuilder::build`] writes the hook shims into `[hooks] dir` (default: yes).
    pub fn with_hook_installation(mut self, enabled: bool) -> Self {
        self.install_hooks = enabled;
        self
    }
}

impl PipelineBuilder<state::Ready> {
    /// Open the event stream, install hook shims and assemble every component.
    pub async fn build(self) -> Result<Pipeline, Error> {
        let PipelineBuilder {
            config,
            stores,
            git,
            stream,
            offsets,
            limiter,
            secret_rules,
            pre_extender,
            post_extender,
            review,
            install_hooks,
            _state,
        } = self;
        let stores = stores.ok_or_else(|| Error::Bug("ready pipeline builder without stores".into()))?;

        let git: Arc<dyn GitReader> = match git {
            Some(git) => git,
            None => Arc::new(GitCli::new(&config.server.git_binary)),
        };
        let stream: Arc<dyn EventStream> = match (stream, &config.events.path) {
            (Some(stream), _) => stream,
            (None, Some(path)) => Arc::new(FileStream::open(path).await?),
            (None, None) => Arc::new(MemoryStream::new()),
        };
        let offsets: Arc<dyn OffsetStore> = match (offsets, &config.events.path) {
            (Some(offsets), _) => offsets,
            (None, Some(path)) => Arc::new(FileOffsets::open(path.with_extension("offsets")).await?),
            (None, None) => Arc::new(MemoryOffsets::new()),
        };
        let limiter: Arc<dyn ResourceLimiter> = match limiter {
            Some(limiter) => limiter,
            None if config.limits.is_unlimited() => Arc::new(UnlimitedLimiter),
            None => Arc::new(QuotaLimiter::new(stores.repos.clone(), config.limits)),
        };

        if install_hooks && config.hooks.is_enabled() {
            if let Some(dir) = &config.hooks.dir {
                hooks::scripts::install(dir, &config.hooks.binary)?;
            }
        }

        let reporter = Reporter::new(stream.clone(), config.server.instance_id.clone(), config.events.max_attempts);
        let mut parts = Parts::new(stores.clone(), git, reporter.clone())?;
        parts.limiter = limiter;
        if let Some(rules) = secret_rules {
            parts.secret_rules = rules;
        }
        if let Some(extender) = pre_extender {
            parts.pre_extender = extender;
        }
        match (post_extender, review) {
            (Some(extender), _) => parts.post_extender = extender,
            (None, Some((provider, sink))) => {
                parts.post_extender = Arc::new(AiReviewExtender::new(
                    stores.settings.clone(),
                    stores.pullreqs.clone(),
                    provider,
                    sink,
                    config.ai,
                ));
            }
            (None, None) => {}
        }
        parts.server = config.server.clone();
        parts.guards = config.guards.clone();
        parts.flow = config.pullreq.flow;
        let controller = Arc::new(Controller::new(parts));

        let sessions = SessionRegistry::new();
        let invoker = GitInvoker::new(
            config.server.clone(),
            config.hooks.clone(),
            config.client.agent_policy(),
            stores.authz.clone(),
            sessions.clone(),
        );
        let dispatcher = Dispatcher::new(stream, offsets, config.events.workers, config.events.max_attempts)
            .register(Arc::new(SourceBranchFollower::new(stores.pullreqs.clone(), reporter.clone())));
        let pullreqs = PullReqService::new(stores.repos.clone(), stores.pullreqs.clone(), reporter.clone());

        tracing::info!(
            git_root = %config.server.git_root.display(),
            hooks = config.hooks.is_enabled(),
            flow = ?config.pullreq.flow,
            "push pipeline ready"
        );
        Ok(Pipeline {
            config,
            stores,
            controller,
            invoker,
            sessions,
            reporter,
            dispatcher,
            pullreqs,
        })
    }
}

/// Every component of the push pipeline, assembled.
pub struct Pipeline {
    config: Config,
    stores: Stores,
    controller: Arc<Controller>,
    invoker: GitInvoker,
    sessions: SessionRegistry,
    reporter: Reporter,
    dispatcher: Dispatcher,
    pullreqs: PullReqService,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder<state::Start> {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn invoker(&self) -> &GitInvoker {
        &self.invoker
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pullreqs(&self) -> &PullReqService {
        &self.pullreqs
    }

    /// The hook callback endpoints `forge-hook` posts to.
    pub fn hook_router(&self) -> Router {
        hooks::server::router(self.sessions.clone(), self.controller.clone())
    }

    /// The smart HTTP endpoints, to be mounted behind authentication middleware.
    pub fn http_router(&self) -> Router {
        http::SmartHttp::new(self.stores.repos.clone(), self.invoker.clone(), self.config.server.api_host.clone())
            .router()
    }

    /// Run the event consumers until `cancel` fires.
    pub fn spawn_event_consumers(&self, cancel: CancellationToken) -> JoinSet<()> {
        self.dispatcher.clone().spawn(cancel)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("controller", &self.controller)
            .field("invoker", &self.invoker)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
