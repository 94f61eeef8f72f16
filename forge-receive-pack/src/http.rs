//! Smart HTTP endpoints: `info/refs`, `git-upload-pack` and `git-receive-pack`.
//!
//! Authentication happens in front of this router; an authenticated caller arrives as a
//! [`Principal`] request extension and anonymous requests have none. Server-side pushes
//! additionally carry [`InternalPush`].

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use forge_serve_core::headers::{basic_auth_challenge, NO_CACHE, NO_SNIFF};
use forge_serve_core::protocol::GitProtocol;
use forge_serve_core::ServiceKind;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

use crate::git::invoker::{GitInvoker, ServiceRequest};
use crate::store::{Principal, RepoStore};
use crate::Error;

const PIPE_CAPACITY: usize = 64 * 1024;
const INFO_REFS: &str = "/info/refs";

/// Marks a request as a push made by the server itself.
#[derive(Debug, Clone, Copy)]
pub struct InternalPush;

#[derive(Clone)]
pub struct SmartHttp {
    repos: Arc<dyn RepoStore>,
    invoker: GitInvoker,
    realm: String,
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

impl SmartHttp {
    /// `realm` is announced in basic-auth challenges, usually the API host name.
    pub fn new(repos: Arc<dyn RepoStore>, invoker: GitInvoker, realm: impl Into<String>) -> Self {
        SmartHttp {
            repos,
            invoker,
            realm: realm.into(),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/*path", get(info_refs).post(service_pack))
            .with_state(self)
    }

    async fn request(
        &self,
        repo_ref: &str,
        service: ServiceKind,
        principal: Option<Principal>,
        internal: bool,
        headers: &HeaderMap,
    ) -> Result<ServiceRequest, Error> {
        let repo = self.repos.find_by_ref(repo_ref).await?;
        let protocol = header_str(headers, "Git-Protocol").and_then(|value| match GitProtocol::parse(value) {
            Ok(protocol) => Some(protocol),
            Err(err) => {
                tracing::debug!(value, error = %err, "ignoring Git-Protocol header");
                None
            }
        });
        Ok(ServiceRequest {
            repo,
            principal,
            service,
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_owned),
            protocol,
            internal,
        })
    }

    fn error_response(&self, err: &Error) -> Response {
        match err {
            Error::Unauthorized => {
                let challenge = basic_auth_challenge(&self.realm);
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, challenge)],
                    "authentication required",
                )
                    .into_response()
            }
            Error::NotAcceptable(msg) => (
                StatusCode::FORBIDDEN,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8"), NO_SNIFF_HEADER],
                msg.clone(),
            )
                .into_response(),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()).into_response(),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
            _ => {
                tracing::warn!(error = %err, "smart http request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

const NO_SNIFF_HEADER: (HeaderName, &str) = (header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.1);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The repository reference in front of `suffix`, without a trailing `.git`.
fn repo_ref<'a>(path: &'a str, suffix: &str) -> Option<&'a str> {
    let repo = path.strip_suffix(suffix)?.trim_matches('/');
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    (!repo.is_empty()).then_some(repo)
}

fn no_cache(headers: &mut HeaderMap) {
    for (name, value) in NO_CACHE {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

async fn info_refs(
    State(http): State<SmartHttp>,
    Path(path): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
) -> Response {
    let Some(repo_ref) = repo_ref(&path, INFO_REFS) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(service) = query.service.as_deref().and_then(|s| s.parse::<ServiceKind>().ok()) else {
        return http.error_response(&Error::Forbidden("unsupported service".into()));
    };
    let advertised = async {
        let req = http
            .request(repo_ref, service, principal.map(|Extension(p)| p), false, &headers)
            .await?;
        http.invoker.info_refs(&req).await
    }
    .await;
    match advertised {
        Ok(body) => {
            let mut response = (
                [(header::CONTENT_TYPE, service.advertisement_content_type())],
                body,
            )
                .into_response();
            no_cache(response.headers_mut());
            response
        }
        Err(err) => http.error_response(&err),
    }
}

async fn service_pack(
    State(http): State<SmartHttp>,
    Path(path): Path<String>,
    principal: Option<Extension<Principal>>,
    internal: Option<Extension<InternalPush>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let service = [ServiceKind::UploadPack, ServiceKind::ReceivePack]
        .into_iter()
        .find_map(|service| repo_ref(&path, &format!("/{}", service.name())).map(|repo| (service, repo)));
    let Some((service, repo_ref)) = service else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let req = match http
        .request(repo_ref, service, principal.map(|Extension(p)| p), internal.is_some(), &headers)
        .await
    {
        Ok(req) => req,
        Err(err) => return http.error_response(&err),
    };
    if let Err(err) = http.invoker.check_access(&req).await {
        return http.error_response(&err);
    }

    let gzip = header_str(&headers, header::CONTENT_ENCODING.as_str()).is_some_and(|e| e.eq_ignore_ascii_case("gzip"));
    let stdin = match request_reader(body, gzip).await {
        Ok(stdin) => stdin,
        Err(err) => return http.error_response(&err),
    };

    let cancel = CancellationToken::new();
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let invoker = http.invoker.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
        // Errors are logged by the invoker; the client sees a truncated response.
        let _ = invoker.service_pack(&req, stdin, writer, token).await;
    });

    // Cancels git once the client stops reading the response.
    let on_disconnect = cancel.drop_guard();
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _ = &on_disconnect;
        chunk
    });
    let mut response = (
        [(header::CONTENT_TYPE, service.result_content_type())],
        Body::from_stream(stream),
    )
        .into_response();
    no_cache(response.headers_mut());
    response
}

type Chunk = io::Result<io::Cursor<Vec<u8>>>;

/// The request body as a reader, gunzipped on a blocking thread if needed.
///
/// A body that does not decode at all is a [`Error::BadRequest`]. Corruption further in surfaces
/// as a read error, so git never sees a cleanly ended but truncated pack.
async fn request_reader(body: Body, gzip: bool) -> Result<Box<dyn AsyncRead + Unpin + Send>, Error> {
    let raw = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    if !gzip {
        return Ok(Box::new(raw));
    }
    let (tx, mut rx) = mpsc::channel::<Chunk>(4);
    let compressed = SyncIoBridge::new(raw);
    tokio::task::spawn_blocking(move || {
        let mut decoder = flate2::read::GzDecoder::new(compressed);
        loop {
            let mut buf = vec![0; PIPE_CAPACITY];
            let chunk = match io::Read::read(&mut decoder, &mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    buf.truncate(n);
                    Ok(io::Cursor::new(buf))
                }
                Err(err) => {
                    tracing::debug!(error = %err, "gzip request body is corrupt");
                    Err(err)
                }
            };
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                return;
            }
        }
    });

    let first = match rx.recv().await {
        Some(Err(err)) => return Err(Error::BadRequest(format!("undecodable gzip body: {err}"))),
        first => first,
    };
    let rest = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
    Ok(Box::new(StreamReader::new(stream::iter(first).chain(rest).boxed())))
}
