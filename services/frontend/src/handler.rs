// HTTP ingress: turns a request into a queued envelope, waits for the
// querier's answer, and writes it back verbatim. Also hosts the
// downstream proxy mode and the slow-query log.
use crate::error::{QueryError, write_error};
use crate::frontend::Frontend;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use quill_queue::Envelope;
use quill_wire::{HttpRequest, HttpResponse};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::form_urlencoded;

/// Header the authentication layer uses to hand us the tenant.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

pub struct HandlerState {
    pub frontend: Arc<Frontend>,
    pub downstream_url: Option<url::Url>,
    pub client: reqwest::Client,
    pub max_body_size: usize,
    pub log_queries_longer_than: Duration,
    pub query_timeout: Option<Duration>,
}

impl HandlerState {
    pub fn new(frontend: Arc<Frontend>, config: &crate::config::FrontendConfig) -> anyhow::Result<Self> {
        let downstream_url = config
            .downstream_url
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(|err| anyhow::anyhow!("parse downstream url: {err}"))?;
        Ok(Self {
            frontend,
            downstream_url,
            client: reqwest::Client::new(),
            max_body_size: config.max_body_size,
            log_queries_longer_than: Duration::from_millis(config.log_queries_longer_than_ms),
            query_timeout: (config.query_timeout_ms > 0)
                .then(|| Duration::from_millis(config.query_timeout_ms)),
        })
    }
}

/// Serve one query. Registered as the router fallback so every path and
/// method lands here.
pub async fn handle_query(
    State(state): State<Arc<HandlerState>>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let tenant = match headers.get(TENANT_HEADER).and_then(|value| value.to_str().ok()) {
        Some(tenant) if !tenant.is_empty() => tenant.to_string(),
        _ => return write_error(&QueryError::MissingTenant),
    };

    // The whole body is buffered: the size limit is enforced here, before
    // anything is queued, and the buffered copy feeds the slow-query log.
    let body = match axum::body::to_bytes(request.into_body(), state.max_body_size).await {
        Ok(body) => body,
        Err(_) => return write_error(&QueryError::BodyTooLarge),
    };

    let response = match &state.downstream_url {
        Some(downstream) => {
            proxy_downstream(&state, downstream, &method, &uri, &headers, body.clone()).await
        }
        None => run_queued(&state, tenant, &method, &uri, &headers, body.clone()).await,
    };

    let elapsed = started.elapsed();
    metrics::histogram!("quill_request_duration_seconds").record(elapsed.as_secs_f64());
    if state.log_queries_longer_than > Duration::ZERO && elapsed > state.log_queries_longer_than {
        log_slow_query(&method, &host, &uri, elapsed, &headers, &body);
    }
    response
}

// Proxy mode: no queueing, no queriers. The inbound Host header is not
// forwarded, so the downstream observes its own host.
async fn proxy_downstream(
    state: &HandlerState,
    downstream: &url::Url,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let mut target = downstream.clone();
    target.set_path(uri.path());
    target.set_query(uri.query());

    let mut builder = state.client.request(method.clone(), target);
    for (name, value) in headers {
        if *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    let result = builder.body(body).send().await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            return write_error(&QueryError::Internal(format!("downstream request: {err}")));
        }
    };
    let status = response.status();
    let response_headers = response.headers().clone();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return write_error(&QueryError::Internal(format!("downstream body: {err}")));
        }
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in &response_headers {
        if *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|err| write_error(&QueryError::Internal(format!("assemble response: {err}"))))
}

// Queue mode: register the pending slot, queue the envelope, and wait
// for the correlated result.
async fn run_queued(
    state: &HandlerState,
    tenant: String,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let frontend: &Frontend = &state.frontend;
    let query_id = frontend.next_query_id();
    let response_rx = frontend.register(query_id);

    let wire_request = HttpRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
    };
    let mut envelope = Envelope::new(query_id, tenant, wire_request);
    envelope.deadline = state.query_timeout.map(|timeout| Instant::now() + timeout);

    if let Err(err) = frontend.enqueue(envelope) {
        return write_error(&err);
    }

    // If this handler future is dropped (the client went away) the guard
    // removes the pending entry and propagates the cancellation to the
    // querier stream the query was dispatched on. Exactly once: a
    // cancelled query is never dispatched again.
    let mut guard = CancelGuard {
        frontend,
        query_id,
        armed: true,
    };

    let result = match state.query_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, response_rx).await {
            Ok(received) => received,
            Err(_) => {
                guard.armed = false;
                let err = match frontend.take_expired(query_id) {
                    Some(true) => QueryError::WorkerLost,
                    // None: a result raced the deadline but the waiting
                    // slot is gone; the deadline still wins.
                    Some(false) | None => QueryError::DeadlineExceeded,
                };
                return write_error(&err);
            }
        },
        None => response_rx.await,
    };
    guard.armed = false;

    match result {
        Ok(Ok(response)) => wire_response(response),
        Ok(Err(err)) => write_error(&err),
        Err(_) => write_error(&QueryError::Internal(
            "query result channel dropped".to_string(),
        )),
    }
}

fn wire_response(response: HttpResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|err| write_error(&QueryError::Internal(format!("assemble response: {err}"))))
}

struct CancelGuard<'a> {
    frontend: &'a Frontend,
    query_id: u64,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.frontend.cancel(self.query_id);
        }
    }
}

// One line per slow query, with a param_<name>=<value> entry for every
// distinct parameter across the URL query and the form body.
fn log_slow_query(
    method: &Method,
    host: &str,
    uri: &Uri,
    elapsed: Duration,
    headers: &HeaderMap,
    body: &Bytes,
) {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(query) = uri.query() {
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            params.entry(name.into_owned()).or_default().push(value.into_owned());
        }
    }
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form && !body.is_empty() {
        if std::str::from_utf8(body).is_ok() {
            for (name, value) in form_urlencoded::parse(body) {
                params.entry(name.into_owned()).or_default().push(value.into_owned());
            }
        } else {
            tracing::warn!("unable to parse form for request");
        }
    }
    let params = params
        .iter()
        .map(|(name, values)| format!("param_{name}={}", values.join(",")))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(
        msg = "slow query detected",
        method = %method,
        host = %host,
        path = %uri.path(),
        time_taken = ?elapsed,
        params = %params,
    );
}
