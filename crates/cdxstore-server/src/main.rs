//! cdxstore HTTP server.
//!
//! Routes: `POST /{collection}` ingests CDX lines and `@alias` directives,
//! `GET /{collection}?url=` streams matching captures as CDX text, and the
//! `/access` subtree manages per-collection rules and policies. Collections
//! are created on first ingest. An optional access-control oracle supplies
//! a process-level capture filter applied to every query.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, Query, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use cdxstore_core::{surt_canonicalize, Capture, ParseError};
use cdxstore_index::{
    AccessControl, AccessFilter, AccessPolicy, AccessRule, CaptureFilter, DataStore, FilterChain,
    Index, StoreError,
};

const QUERY_CHANNEL_DEPTH: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "cdxstore", version, about = "Web-archive capture index server")]
struct Args {
    /// Bind to a particular address
    #[arg(short = 'b', long)]
    bind: Option<String>,
    /// Local port to listen on
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// Directory to store index data under
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,
    /// Filter query results through a wayback access-control oracle
    #[arg(short = 'a', long)]
    access_oracle: Option<String>,
    /// Take the listening socket from fd 0 (inetd/systemd style)
    #[arg(short = 'i', long)]
    inherit: bool,
    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Optional TOML config file; command-line flags win
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    bind: Option<String>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    access_oracle: Option<String>,
}

#[derive(Debug)]
struct ServerConfig {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    access_oracle: Option<String>,
    inherit: bool,
    verbose: bool,
}

impl ServerConfig {
    fn resolve(args: Args, file: FileConfig) -> Self {
        Self {
            bind: args.bind.or(file.bind).unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(file.port).unwrap_or(8080),
            data_dir: args
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from("data")),
            access_oracle: args.access_oracle.or(file.access_oracle),
            inherit: args.inherit,
            verbose: args.verbose,
        }
    }
}

fn load_file_config(path: Option<&PathBuf>) -> anyhow::Result<FileConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(FileConfig::default()),
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<DataStore>,
    #[cfg(feature = "metrics")]
    metrics_handle: PrometheusHandle,
}

#[derive(Clone)]
struct CorrelationId(String);

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    NotFound,
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // Ingest and query speak plain text, matching their payloads.
            ApiError::Store(StoreError::Malformed { line, source }) => (
                StatusCode::BAD_REQUEST,
                format!("{source}\nAt line: {line}\n"),
            )
                .into_response(),
            ApiError::Store(StoreError::UnknownCollection(_)) => {
                (StatusCode::NOT_FOUND, "Collection does not exist\n").into_response()
            }
            ApiError::Store(err @ StoreError::UnknownPolicy(_)) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
            ApiError::Store(err @ StoreError::InvalidCollectionName(_)) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
            ApiError::Store(err @ StoreError::OracleUnavailable(_)) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
            ApiError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}

async fn correlation_layer(mut req: Request<Body>, next: Next) -> impl IntoResponse {
    let header_key = axum::http::header::HeaderName::from_static("x-request-id");
    let cid = req
        .headers()
        .get(&header_key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&cid) {
        req.headers_mut().insert(&header_key, value);
    }
    req.extensions_mut().insert(CorrelationId(cid.clone()));
    let span = info_span!(
        "http.request",
        request_id = %cid,
        method = %req.method(),
        path = %req.uri().path()
    );
    next.run(req).instrument(span).await
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

async fn collections_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    let collections = state.store.collections();
    #[cfg(feature = "metrics")]
    cdxstore_metrics::record_collection_count(collections.len() as u64);
    Json(collections)
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    url: Option<String>,
    accesspoint: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct CollectionDetails {
    name: String,
    estimated_records: usize,
}

async fn collection_get_handler(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(collection): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let index = state
        .store
        .index(&collection)
        .ok_or(StoreError::UnknownCollection(collection.clone()))?;

    let Some(url) = params.url else {
        return Ok(Json(CollectionDetails {
            name: index.name().to_string(),
            estimated_records: index.estimated_record_count(),
        })
        .into_response());
    };

    let mut chain = FilterChain::new();
    if let Some(filter) = state.store.filter() {
        chain.push(filter);
    }
    if let Some(access_point) = params.accesspoint.as_deref() {
        chain.push(Arc::new(AccessFilter::new(
            index.access(),
            access_point,
            OffsetDateTime::now_utc(),
        )));
    }

    let urlkey = surt_canonicalize(&url);
    debug!(request_id = %correlation.0, collection, urlkey, "query");
    let started = Instant::now();

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(QUERY_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || stream_query(&index, &urlkey, &chain, tx, started));

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Ok(response)
}

/// Walk the index span, apply the filter chain and feed the response
/// channel. A closed channel means the client went away; the cursor is
/// released by returning.
fn stream_query(
    index: &Index,
    urlkey: &str,
    chain: &FilterChain,
    tx: mpsc::Sender<io::Result<Bytes>>,
    started: Instant,
) {
    let mut returned = 0u64;
    let mut suppressed = 0u64;
    let query = match index.query(urlkey) {
        Ok(query) => query,
        Err(e) => {
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
            return;
        }
    };
    for item in query {
        let capture = match item {
            Ok(capture) => capture,
            Err(e) => {
                warn!(error = %e, "query scan failed");
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
                return;
            }
        };
        match chain.accept(&capture) {
            Ok(true) => {
                let mut line = capture.to_cdx_line();
                line.push('\n');
                if tx.blocking_send(Ok(Bytes::from(line))).is_err() {
                    return;
                }
                returned += 1;
            }
            Ok(false) => suppressed += 1,
            Err(e) => {
                warn!(error = %e, "capture filter failed");
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
                return;
            }
        }
    }
    #[cfg(feature = "metrics")]
    {
        cdxstore_metrics::record_query_latency(started.elapsed());
        cdxstore_metrics::record_captures_returned(returned);
        cdxstore_metrics::record_captures_suppressed(suppressed);
    }
    debug!(
        returned,
        suppressed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query stream complete"
    );
}

async fn ingest_handler(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(collection): Path<String>,
    body: String,
) -> Result<String, ApiError> {
    let started = Instant::now();
    let store = state.store.clone();
    let name = collection.clone();
    let result = tokio::task::spawn_blocking(move || ingest_batch(&store, &name, &body))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let added = match result {
        Ok(added) => added,
        Err(e) => {
            #[cfg(feature = "metrics")]
            cdxstore_metrics::record_batch_abort();
            return Err(e.into());
        }
    };
    #[cfg(feature = "metrics")]
    {
        cdxstore_metrics::record_ingest_latency(started.elapsed());
        cdxstore_metrics::record_records_added(added as u64);
    }
    info!(
        request_id = %correlation.0,
        collection,
        added,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ingest complete"
    );
    Ok(format!("Added {added} records\n"))
}

/// Parse the request body into one batch and commit it. Any malformed line
/// fails the call before commit, so the batch is all-or-nothing.
fn ingest_batch(store: &DataStore, collection: &str, body: &str) -> cdxstore_index::Result<usize> {
    let index = store.index_or_create(collection)?;
    let mut batch = index.begin_update();
    for raw in body.lines() {
        // The optional " CDX ..." header line carries no record.
        if raw.starts_with(" CDX") {
            continue;
        }
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("@alias ") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let [source, target] = tokens[..] else {
                return Err(StoreError::Malformed {
                    line: line.to_string(),
                    source: ParseError::AliasArity {
                        found: tokens.len() + 1,
                    },
                });
            };
            batch.put_alias(&surt_canonicalize(source), &surt_canonicalize(target));
        } else {
            let capture = Capture::from_cdx_line(line).map_err(|e| StoreError::Malformed {
                line: line.to_string(),
                source: e,
            })?;
            debug!(urlkey = %capture.urlkey, timestamp = capture.timestamp, "staging capture");
            batch.put_capture(&capture)?;
        }
    }
    batch.commit()
}

fn access_for(state: &AppState, collection: &str) -> Result<Arc<AccessControl>, ApiError> {
    Ok(state.store.index_or_create(collection)?.access())
}

async fn list_rules_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<AccessRule>>, ApiError> {
    Ok(Json(access_for(&state, &collection)?.list_rules()))
}

async fn put_rule_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(rule): Json<AccessRule>,
) -> Result<Json<u64>, ApiError> {
    let id = access_for(&state, &collection)?.put_rule(rule)?;
    Ok(Json(id))
}

async fn get_rule_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, u64)>,
) -> Result<Json<AccessRule>, ApiError> {
    match access_for(&state, &collection)?.rule(id) {
        Some(rule) => Ok(Json(rule)),
        None => Err(ApiError::NotFound),
    }
}

async fn delete_rule_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = access_for(&state, &collection)?.delete_rule(id)?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn list_policies_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<AccessPolicy>>, ApiError> {
    Ok(Json(access_for(&state, &collection)?.list_policies()))
}

async fn put_policy_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(policy): Json<AccessPolicy>,
) -> Result<Json<u64>, ApiError> {
    let id = access_for(&state, &collection)?.put_policy(policy)?;
    Ok(Json(id))
}

async fn get_policy_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, u64)>,
) -> Result<Json<AccessPolicy>, ApiError> {
    match access_for(&state, &collection)?.policy(id) {
        Some(policy) => Ok(Json(policy)),
        None => Err(ApiError::NotFound),
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        body,
    )
}

/// Visibility oracle queried per capture; anything but an `allow` body
/// denies, and transport failures abort the query rather than leak.
struct OracleFilter {
    url: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl OracleFilter {
    fn new(url: String) -> Self {
        Self {
            url,
            client: OnceLock::new(),
        }
    }
}

impl CaptureFilter for OracleFilter {
    fn accept(&self, capture: &Capture) -> cdxstore_index::Result<bool> {
        // Built lazily: accept only runs on blocking query threads, never
        // on the async runtime.
        let client = self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new())
        });
        let access_time = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| StoreError::OracleUnavailable(e.to_string()))?;
        let capture_time = capture.timestamp.to_string();
        let response = client
            .get(&self.url)
            .query(&[
                ("url", capture.original.as_str()),
                ("capture", capture_time.as_str()),
                ("access", access_time.as_str()),
                ("accesspoint", "public"),
            ])
            .send()
            .map_err(|e| StoreError::OracleUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::OracleUnavailable(format!(
                "oracle returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .map_err(|e| StoreError::OracleUnavailable(e.to_string()))?;
        Ok(body.trim() == "allow")
    }
}

fn router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(collections_handler))
        .route("/collections", get(collections_handler))
        .route("/healthz", get(healthz_handler))
        .route(
            "/:collection",
            get(collection_get_handler).post(ingest_handler),
        )
        .route(
            "/:collection/access/rules",
            get(list_rules_handler).post(put_rule_handler),
        )
        .route(
            "/:collection/access/rules/:id",
            get(get_rule_handler).delete(delete_rule_handler),
        )
        .route(
            "/:collection/access/policies",
            get(list_policies_handler).post(put_policy_handler),
        )
        .route("/:collection/access/policies/:id", get(get_policy_handler))
        .route_layer(middleware::from_fn(correlation_layer));
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));
    router.with_state(state)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(feature = "metrics")]
fn init_metrics_recorder() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

#[cfg(unix)]
fn inherited_listener() -> anyhow::Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;
    // inetd/systemd socket activation hands us the listener on fd 0.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(0) };
    Ok(listener)
}

#[cfg(not(unix))]
fn inherited_listener() -> anyhow::Result<std::net::TcpListener> {
    anyhow::bail!("--inherit is only supported on unix")
}

async fn make_listener(config: &ServerConfig) -> anyhow::Result<tokio::net::TcpListener> {
    if config.inherit {
        let listener = inherited_listener()?;
        listener.set_nonblocking(true)?;
        return Ok(tokio::net::TcpListener::from_std(listener)?);
    }
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.bind, config.port))?;
    Ok(tokio::net::TcpListener::bind(addr).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = load_file_config(args.config.as_ref())?;
    let config = ServerConfig::resolve(args, file);
    init_tracing(config.verbose);

    let filter: Option<Arc<dyn CaptureFilter>> = config
        .access_oracle
        .clone()
        .map(|url| Arc::new(OracleFilter::new(url)) as Arc<dyn CaptureFilter>);
    let store = Arc::new(DataStore::open(&config.data_dir, filter)?);

    #[cfg(feature = "metrics")]
    let metrics_handle = init_metrics_recorder();
    let state = AppState {
        store: store.clone(),
        #[cfg(feature = "metrics")]
        metrics_handle,
    };

    let listener = make_listener(&config).await?;
    info!(
        addr = %listener.local_addr()?,
        data_dir = %config.data_dir.display(),
        oracle = config.access_oracle.as_deref().unwrap_or("none"),
        "cdxstore listening"
    );

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    store.close()?;
    Ok(())
}
