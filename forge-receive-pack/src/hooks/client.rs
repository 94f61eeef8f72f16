//! The calling side of the hook channel, used by the `forge-hook` binary.

use std::time::Duration;

use super::env::HookContext;
use super::{HookInput, HookKind, HookOutput};
use crate::Error;

/// Path of the callback endpoint for `kind` below the hook server's base URL.
pub fn callback_path(kind: HookKind) -> String {
    format!("/v1/githook/{kind}")
}

/// Posts hook payloads to the server that spawned `receive-pack`.
#[derive(Debug, Clone)]
pub struct HookClient {
    agent: ureq::Agent,
    url: String,
    token: String,
}

impl HookClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        HookClient {
            agent,
            url: url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    pub fn from_context(ctx: &HookContext) -> Self {
        Self::new(&ctx.url, &ctx.token)
    }

    /// Deliver `input` to the `kind` hook and return the server's verdict.
    ///
    /// Calls have no deadline of their own; the server cancels them when the push goes away.
    pub fn call(&self, kind: HookKind, input: &HookInput) -> Result<HookOutput, Error> {
        let url = format!("{}{}", self.url, callback_path(kind));
        tracing::debug!(%url, updates = input.ref_updates.len(), "calling hook server");
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(input);
        match response {
            Ok(response) => response
                .into_json::<HookOutput>()
                .map_err(|err| Error::Transport(format!("{kind} answer unreadable: {err}"))),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(Error::Transport(format!(
                    "{kind} callback answered {code}: {}",
                    body.trim()
                )))
            }
            Err(err) => Err(Error::Transport(format!("{kind} callback failed: {err}"))),
        }
    }
}
