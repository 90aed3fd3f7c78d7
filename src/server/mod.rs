//! The HTTP surface: request binding, the long-running-operation to
//! newline-JSON stream adaptor, the process-wide generate lock, and
//! cancellation tied to the client connection.

use axum::{
    body::{Body, Bytes},
    extract::{Json, State as AxumState},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete as axum_delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::llm::{Options, PredictRequest, Session};
use crate::names::ModelRef;
use crate::parser;
use crate::registry::{Progress, RegistryAuth, RegistryClient};
use crate::store::{mediatype, Layer, Manifest, ModelStore};
use crate::template;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ModelStore>,
    pub registry: Arc<RegistryClient>,
    /// The one inference session; the mutex serialises generate end-to-end.
    pub runner: Arc<tokio::sync::Mutex<Option<Session>>>,
}

impl AppState {
    pub fn new(models_dir: impl Into<std::path::PathBuf>) -> crate::error::Result<Self> {
        let store = Arc::new(ModelStore::new(models_dir)?);
        let registry = Arc::new(RegistryClient::new(store.clone())?);
        Ok(AppState {
            store,
            registry,
            runner: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    pub system: Option<String>,
    pub template: Option<String>,
    pub context: Option<Vec<i32>>,
    pub options: Option<HashMap<String, Value>>,
    pub session_id: Option<i64>,
}

#[derive(Debug, Serialize, Default)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: String,
    pub response: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub name: String,
    #[serde(default)]
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub modified_at: String,
    pub size: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/generate", post(generate))
        .route("/api/pull", post(pull_model))
        .route("/api/push", post(push_model))
        .route("/api/create", post(create_model))
        .route("/api/copy", post(copy_model))
        .route("/api/delete", axum_delete(delete_model))
        .route("/api/tags", get(list_models))
        .layer(axum::middleware::from_fn(crate::middleware::cors_middleware))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let state = AppState::new(crate::envconfig::models_dir())?;
    let app = router(state);

    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "Ollama is running"
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::BadRequest(_) | Error::Parse { .. } | Error::Tokenize => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        Error::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}

/// Wire an mpsc receiver of encoded lines up as a newline-JSON response.
fn ndjson(rx: mpsc::Receiver<Result<Bytes, Infallible>>) -> Response {
    Response::builder()
        .header(CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

fn line(value: &impl Serialize) -> Bytes {
    let mut text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    text.push('\n');
    Bytes::from(text)
}

async fn generate(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    let started = Instant::now();

    let reference = match ModelRef::parse(&req.model) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    // An unknown model is an unresolvable reference here, not a 404.
    let model = match state.store.resolve(&reference) {
        Ok(m) => m,
        Err(Error::NotFound(what)) => {
            return error_response(&Error::BadRequest(format!("{what} not found")))
        }
        Err(e) => return error_response(&e),
    };
    let options = match Options::merged(model.params.as_deref(), req.options.as_ref()) {
        Ok(o) => o,
        Err(e) => return error_response(&e),
    };

    // Assemble the final prompt: request overrides win over manifest layers,
    // and models without a template fall back to the closest bundled one.
    let context = req.context.clone().unwrap_or_default();
    let vars = template::Vars {
        system: req
            .system
            .clone()
            .or_else(|| model.system.clone())
            .unwrap_or_default(),
        prompt: req.prompt.clone(),
        first: context.is_empty(),
    };
    let template_text = req
        .template
        .clone()
        .or_else(|| model.template.clone())
        .unwrap_or_else(|| {
            let base = model
                .model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            template::builtin_for(&base).to_string()
        });
    let prompt = match template::render(&template_text, &vars) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    // One generation at a time, process-wide. The guard travels into the
    // producer so the lock covers the whole stream.
    let guard = state.runner.clone().lock_owned().await;

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
    let cancel = CancellationToken::new();
    let model_name = req.model.clone();
    let session_request = req.session_id;

    tokio::task::spawn_blocking(move || {
        let mut guard = guard;

        let load_started = Instant::now();
        let reuse = match (session_request, guard.as_ref()) {
            (Some(id), Some(session)) => {
                session.id == id && !session.needs_reload(&model.model_path, &options)
            }
            _ => guard
                .as_ref()
                .map(|s| !s.needs_reload(&model.model_path, &options))
                .unwrap_or(false),
        };
        if !reuse {
            // Tear down the old session before building the new one.
            *guard = None;
            match Session::load(&model.model_path, &model.adapter_paths, &options) {
                Ok(session) => *guard = Some(session),
                Err(e) => {
                    let _ = tx.blocking_send(Ok(line(&json!({ "error": e.to_string() }))));
                    return;
                }
            }
        }
        let load_duration = load_started.elapsed();
        let session = guard.as_mut().expect("session was just ensured");

        let token_tx = tx.clone();
        let token_model = model_name.clone();
        let emit = move |text: &str| {
            let item = GenerateResponse {
                model: token_model.clone(),
                created_at: Utc::now().to_rfc3339(),
                response: text.to_string(),
                done: false,
                ..GenerateResponse::default()
            };
            // Backpressure and disconnect detection in one: the channel has
            // room for a single token, and a closed channel ends the loop.
            token_tx.blocking_send(Ok(line(&item))).is_ok()
        };

        let predict = PredictRequest {
            prompt: &prompt,
            context: &context,
            options: &options,
        };
        match session.predict(&predict, &cancel, emit) {
            Ok(result) => {
                let item = GenerateResponse {
                    model: model_name,
                    created_at: Utc::now().to_rfc3339(),
                    response: String::new(),
                    done: true,
                    session_id: Some(session.id),
                    context: Some(result.context),
                    total_duration: Some(started.elapsed().as_nanos() as i64),
                    load_duration: Some(load_duration.as_nanos() as i64),
                    prompt_eval_count: Some(result.prompt_eval_count as i64),
                    prompt_eval_duration: Some(result.prompt_eval_duration.as_nanos() as i64),
                    eval_count: Some(result.eval_count as i64),
                    eval_duration: Some(result.eval_duration.as_nanos() as i64),
                };
                let _ = tx.blocking_send(Ok(line(&item)));
            }
            Err(Error::Canceled) => {
                debug!("generation canceled by client");
            }
            Err(e) => {
                if matches!(e, Error::Eval(_)) {
                    // The backend may be in a torn state; reload next time.
                    *guard = None;
                }
                let _ = tx.blocking_send(Ok(line(&json!({ "error": e.to_string() }))));
            }
        }
    });

    ndjson(rx)
}

async fn pull_model(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<TransferRequest>,
) -> Response {
    let reference = match ModelRef::parse(&req.name) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let auth = RegistryAuth {
        username: req.username,
        password: req.password,
        insecure: req.insecure,
    };

    // Surface registry reachability problems as a status code while we
    // still can; after this everything streams.
    if let Err(e) = state.registry.fetch_manifest(&reference, &auth).await {
        return error_response(&e);
    }

    let registry = state.registry.clone();
    stream_transfer(move |cancel, report| async move {
        registry.pull(&reference, &auth, &cancel, report.as_ref()).await
    })
}

async fn push_model(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<TransferRequest>,
) -> Response {
    let reference = match ModelRef::parse(&req.name) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    if let Err(e) = state.store.read_manifest(&reference) {
        return error_response(&e);
    }
    let auth = RegistryAuth {
        username: req.username,
        password: req.password,
        insecure: req.insecure,
    };

    let registry = state.registry.clone();
    stream_transfer(move |cancel, report| async move {
        registry.push(&reference, &auth, &cancel, report.as_ref()).await
    })
}

type ReportFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Adaptor shared by pull and push: run the transfer on a task, forward its
/// progress as one JSON line each, cancel it when the client goes away.
fn stream_transfer<F, Fut>(transfer: F) -> Response
where
    F: FnOnce(CancellationToken, ReportFn) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    let cancel = CancellationToken::new();

    let progress_tx = tx.clone();
    let progress_cancel = cancel.clone();
    let report: ReportFn = Arc::new(move |progress: Progress| {
        if progress_tx.try_send(Ok(line(&progress))).is_err() && progress_tx.is_closed() {
            progress_cancel.cancel();
        }
    });

    tokio::spawn(async move {
        match transfer(cancel, report).await {
            Ok(()) => {}
            Err(Error::Canceled) => debug!("transfer canceled by client"),
            Err(e) => {
                let _ = tx.send(Ok(line(&json!({ "error": e.to_string() })))).await;
            }
        }
    });

    ndjson(rx)
}

async fn create_model(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<CreateRequest>,
) -> Response {
    let reference = match ModelRef::parse(&req.name) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    if state.store.has_manifest(&reference) {
        return error_response(&Error::Conflict(format!("model {}", reference.short_name())));
    }
    let contents = match std::fs::read_to_string(&req.path) {
        Ok(c) => c,
        Err(_) => {
            return error_response(&Error::BadRequest(format!(
                "modelfile {} not found",
                req.path
            )))
        }
    };
    let modelfile = match parser::parse(&contents) {
        Ok(m) => m,
        Err(e) => return error_response(&e),
    };
    let Some(from) = modelfile.from_value().map(str::to_string) else {
        return error_response(&Error::BadRequest(
            "modelfile must contain a FROM directive".to_string(),
        ));
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    let cancel = CancellationToken::new();

    tokio::spawn(async move {
        let report = |status: &str| {
            let _ = tx.try_send(Ok(line(&json!({ "status": status }))));
        };
        report("parsing modelfile");

        match build_model(&state, &reference, &from, &modelfile, &cancel, &tx).await {
            Ok(()) => report("success"),
            Err(Error::Canceled) => debug!("create canceled by client"),
            Err(e) => {
                let _ = tx.send(Ok(line(&json!({ "error": e.to_string() })))).await;
            }
        }
    });

    ndjson(rx)
}

/// Turn a parsed modelfile into layers and write the manifest.
async fn build_model(
    state: &AppState,
    reference: &ModelRef,
    from: &str,
    modelfile: &parser::Modelfile,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
) -> crate::error::Result<()> {
    let report = |status: String| {
        let _ = tx.try_send(Ok(line(&json!({ "status": status }))));
    };

    // The base is either a local weights file or another model whose layers
    // this one extends.
    let mut layers: Vec<Layer> = Vec::new();
    if Path::new(from).is_file() {
        report(format!("creating model layer from {from}"));
        let file = std::fs::File::open(from)?;
        let (digest, size) = state.store.put_blob(file)?;
        layers.push(Layer {
            media_type: mediatype::MODEL.to_string(),
            digest,
            size,
        });
    } else {
        let base = ModelRef::parse(from).map_err(|_| {
            Error::BadRequest(format!("FROM {from} is neither a file nor a model reference"))
        })?;
        if !state.store.has_manifest(&base) {
            report(format!("pulling base model {}", base.short_name()));
            let progress_tx = tx.clone();
            let progress_cancel = cancel.clone();
            let progress: ReportFn = Arc::new(move |p: Progress| {
                if progress_tx.try_send(Ok(line(&p))).is_err() && progress_tx.is_closed() {
                    progress_cancel.cancel();
                }
            });
            state
                .registry
                .pull(&base, &RegistryAuth::default(), cancel, progress.as_ref())
                .await?;
        }
        let base_manifest = state.store.read_manifest(&base)?;
        layers = base_manifest.layers;
    }

    for adapter in modelfile.adapters() {
        report(format!("creating adapter layer from {adapter}"));
        let file = std::fs::File::open(adapter)
            .map_err(|_| Error::BadRequest(format!("adapter {adapter} not found")))?;
        let (digest, size) = state.store.put_blob(file)?;
        layers.push(Layer {
            media_type: mediatype::ADAPTER.to_string(),
            digest,
            size,
        });
    }

    let mut replace_text_layer = |media_type: &str, text: &str| -> crate::error::Result<()> {
        let (digest, size) = state.store.put_blob(std::io::Cursor::new(text.as_bytes().to_vec()))?;
        layers.retain(|l| l.media_type != media_type);
        layers.push(Layer {
            media_type: media_type.to_string(),
            digest,
            size,
        });
        Ok(())
    };

    if let Some(text) = modelfile.template() {
        report("creating template layer".to_string());
        replace_text_layer(mediatype::TEMPLATE, text)?;
    }
    if let Some(text) = modelfile.system() {
        report("creating system layer".to_string());
        replace_text_layer(mediatype::SYSTEM, text)?;
    }
    if let Some(text) = modelfile.license() {
        report("creating license layer".to_string());
        replace_text_layer(mediatype::LICENSE, text)?;
    }

    let parameters = modelfile.parameters();
    if !parameters.is_empty() {
        report("creating parameter layer".to_string());
        let params = params_to_json(&parameters);
        replace_text_layer(mediatype::PARAMS, &serde_json::to_string(&params)?)?;
    }

    let config_bytes = serde_json::to_vec(&json!({ "model_format": "gguf" }))?;
    let (digest, size) = state.store.put_blob(std::io::Cursor::new(config_bytes))?;
    let config = Layer {
        media_type: mediatype::CONFIG.to_string(),
        digest,
        size,
    };

    report("writing manifest".to_string());
    state
        .store
        .write_manifest(reference, &Manifest::new(config, layers))
}

/// Convert `PARAMETER key value` strings to typed JSON: repeated `stop`
/// keys accumulate into an array, numerics and booleans keep their type.
fn params_to_json(parameters: &[(String, String)]) -> Value {
    let mut map = serde_json::Map::new();
    for (key, raw) in parameters {
        let value = typed_param(raw);
        match map.entry(key.clone()) {
            serde_json::map::Entry::Occupied(mut entry) => match entry.get_mut() {
                Value::Array(items) => items.push(value),
                existing => {
                    let prior = existing.take();
                    *existing = Value::Array(vec![prior, value]);
                }
            },
            serde_json::map::Entry::Vacant(entry) => {
                // Stop sequences are a list even when only one is given.
                if key == "stop" {
                    entry.insert(Value::Array(vec![value]));
                } else {
                    entry.insert(value);
                }
            }
        }
    }
    Value::Object(map)
}

fn typed_param(raw: &str) -> Value {
    let trimmed = raw.trim().trim_matches('"');
    if let Ok(b) = trimmed.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

async fn copy_model(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<CopyRequest>,
) -> Response {
    let source = match ModelRef::parse(&req.source) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let destination = match ModelRef::parse(&req.destination) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    match state.store.copy(&source, &destination) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_model(
    AxumState(state): AxumState<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Response {
    let reference = match ModelRef::parse(&req.name) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    match state.store.delete(&reference) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_models(AxumState(state): AxumState<AppState>) -> Response {
    match state.store.list() {
        Ok(models) => {
            let models = models
                .into_iter()
                .map(|m| ModelInfo {
                    name: m.reference.short_name(),
                    modified_at: m.modified_at.to_rfc3339(),
                    size: m.size,
                })
                .collect();
            Json(ListResponse { models }).into_response()
        }
        Err(e) => error_response(&e),
    }
}
