//! The receiving side of the hook channel.
//!
//! Each push session gets a bearer token from the [`SessionRegistry`]; a call is only served
//! while its session is live, and the session is authoritative for who pushes where.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use super::{HookHandler, HookInput, HookKind, HookOutput};
use crate::error::Class;
use crate::session::{PushSession, SessionRegistry};
use crate::Error;

#[derive(Clone)]
struct HookState {
    sessions: SessionRegistry,
    handler: Arc<dyn HookHandler>,
}

/// Routes `POST /v1/githook/{kind}` to `handler`.
pub fn router(sessions: SessionRegistry, handler: Arc<dyn HookHandler>) -> Router {
    Router::new()
        .route("/v1/githook/:kind", post(handle))
        .with_state(HookState { sessions, handler })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn handle(
    State(state): State<HookState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(input): Json<HookInput>,
) -> Response {
    let Ok(kind) = kind.parse::<HookKind>() else {
        return (StatusCode::NOT_FOUND, format!("unknown hook {kind:?}")).into_response();
    };
    let Some(session) = bearer(&headers).and_then(|token| state.sessions.get(token)) else {
        tracing::warn!(hook = %kind, "hook call without a live session");
        return (StatusCode::UNAUTHORIZED, "unknown push session").into_response();
    };
    if let Err(err) = session.verify(&input) {
        tracing::warn!(hook = %kind, session = %session.id(), error = %err, "hook payload does not match its session");
        return (StatusCode::FORBIDDEN, err.to_string()).into_response();
    }

    match dispatch(state.handler, session, kind, input).await {
        Ok(out) => Json(out).into_response(),
        Err(err) => error_response(kind, &err),
    }
}

async fn dispatch(
    handler: Arc<dyn HookHandler>,
    session: Arc<PushSession>,
    kind: HookKind,
    input: HookInput,
) -> Result<HookOutput, Error> {
    match kind {
        HookKind::PreReceive => handler.pre_receive(&session, &input).await,
        HookKind::Update => handler.update(&session, &input).await,
        // Refs have moved already, so reporting runs to completion even if the caller hangs up.
        HookKind::PostReceive => tokio::spawn(async move { handler.post_receive(&session, &input).await })
            .await
            .map_err(|err| Error::Bug(format!("post-receive task failed: {err}")))?,
    }
}

fn error_response(kind: HookKind, err: &Error) -> Response {
    match err {
        Error::Forbidden(_) => (StatusCode::FORBIDDEN, err.to_string()).into_response(),
        _ => {
            if err.class() == Class::FatalBug {
                tracing::error!(hook = %kind, error = %err, "hook call failed");
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error while checking the push").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait::async_trait]
    impl HookHandler for Echo {
        async fn pre_receive(&self, _: &PushSession, input: &HookInput) -> Result<HookOutput, Error> {
            let mut out = HookOutput::default();
            out.message(format!("{} updates", input.ref_updates.len()));
            Ok(out)
        }
        async fn update(&self, _: &PushSession, _: &HookInput) -> Result<HookOutput, Error> {
            Err(Error::Store("db down".into()))
        }
        async fn post_receive(&self, _: &PushSession, _: &HookInput) -> Result<HookOutput, Error> {
            Ok(HookOutput::default())
        }
    }

    fn request(kind: &str, token: Option<&str>, repo_id: i64) -> Request<Body> {
        let body = serde_json::json!({"repoId": repo_id, "principalId": 2, "refUpdates": []});
        let mut req = Request::post(format!("/v1/githook/{kind}")).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn calls_need_a_live_matching_session() {
        let sessions = SessionRegistry::new();
        let app = router(sessions.clone(), Arc::new(Echo));
        let guard = sessions.open(PushSession::new(1, 2, false, CancellationToken::new()));

        let res = app.clone().oneshot(request("pre-receive", None, 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = app.clone().oneshot(request("pre-receive", Some("bogus"), 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = app.clone().oneshot(request("pre-receive", Some(guard.token()), 7)).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let res = app.clone().oneshot(request("pre-commit", Some(guard.token()), 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = app.clone().oneshot(request("pre-receive", Some(guard.token()), 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let token = guard.token().to_owned();
        drop(guard);
        let res = app.oneshot(request("pre-receive", Some(&token), 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn failures_become_generic_server_errors() {
        let sessions = SessionRegistry::new();
        let app = router(sessions.clone(), Arc::new(Echo));
        let guard = sessions.open(PushSession::new(1, 2, false, CancellationToken::new()));
        let res = app.oneshot(request("update", Some(guard.token()), 1)).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("db down"));
    }
}
