//! Pull/push protocol tests against an in-process stub registry that speaks
//! just enough of the content-addressed wire format: ranged blob reads,
//! chunked uploads, and a bearer-token challenge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ollamad::names::ModelRef;
use ollamad::registry::{Progress, RegistryAuth, RegistryClient};
use ollamad::store::{digest_bytes, mediatype, Layer, Manifest, ModelStore};

#[derive(Default)]
struct StubState {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, String>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    /// Offsets of every ranged blob request, for resume assertions.
    range_offsets: Mutex<Vec<u64>>,
    /// When set, every request without this bearer token gets a challenge.
    token: Option<String>,
    addr: Mutex<Option<SocketAddr>>,
}

type Stub = Arc<StubState>;

async fn auth_layer(State(stub): State<Stub>, req: Request, next: Next) -> Response {
    if let Some(expected) = &stub.token {
        if req.uri().path() == "/token" {
            return next.run(req).await;
        }
        let authorized = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {expected}"))
            .unwrap_or(false);
        if !authorized {
            let addr = stub.addr.lock().unwrap().unwrap();
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(
                    header::WWW_AUTHENTICATE,
                    format!(r#"Bearer realm="http://{addr}/token",service="stub""#),
                )
                .body(axum::body::Body::empty())
                .unwrap();
        }
    }
    next.run(req).await
}

async fn token(State(stub): State<Stub>) -> Json<serde_json::Value> {
    Json(json!({ "token": stub.token.clone().unwrap_or_default() }))
}

async fn get_manifest(State(stub): State<Stub>, Path((name, tag)): Path<(String, String)>) -> Response {
    match stub.manifests.lock().unwrap().get(&format!("{name}:{tag}")) {
        Some(body) => (
            [(header::CONTENT_TYPE, mediatype::MANIFEST)],
            body.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_manifest(
    State(stub): State<Stub>,
    Path((name, tag)): Path<(String, String)>,
    body: String,
) -> StatusCode {
    stub.manifests
        .lock()
        .unwrap()
        .insert(format!("{name}:{tag}"), body);
    StatusCode::CREATED
}

async fn get_blob(
    State(stub): State<Stub>,
    Path((_name, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let blobs = stub.blobs.lock().unwrap();
    let Some(data) = blobs.get(&digest) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let offset = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    stub.range_offsets.lock().unwrap().push(offset);

    if offset == 0 {
        return data.clone().into_response();
    }
    (
        StatusCode::PARTIAL_CONTENT,
        data[offset as usize..].to_vec(),
    )
        .into_response()
}

async fn head_blob(
    State(stub): State<Stub>,
    Path((_name, digest)): Path<(String, String)>,
) -> StatusCode {
    if stub.blobs.lock().unwrap().contains_key(&digest) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn start_upload(State(stub): State<Stub>, Path(name): Path<String>) -> Response {
    let id = stub.uploads.lock().unwrap().len();
    stub.uploads.lock().unwrap().insert(id.to_string(), Vec::new());
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Location", format!("/v2/library/{name}/blobs/uploads/{id}"))
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn patch_upload(
    State(stub): State<Stub>,
    Path((name, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    stub.uploads
        .lock()
        .unwrap()
        .get_mut(&id)
        .unwrap()
        .extend_from_slice(&body);
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Location", format!("/v2/library/{name}/blobs/uploads/{id}"))
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn finish_upload(
    State(stub): State<Stub>,
    Path((_name, id)): Path<(String, String)>,
    req: Request,
) -> StatusCode {
    let digest = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("digest=")))
        .unwrap_or_default()
        .to_string();
    let data = stub.uploads.lock().unwrap().remove(&id).unwrap();
    stub.blobs.lock().unwrap().insert(digest, data);
    StatusCode::CREATED
}

async fn start_stub(token: Option<String>) -> (Stub, String) {
    let stub: Stub = Arc::new(StubState {
        token,
        ..StubState::default()
    });
    let app = Router::new()
        .route("/token", get(self::token))
        .route("/v2/library/:name/manifests/:tag", get(get_manifest).put(put_manifest))
        .route("/v2/library/:name/blobs/uploads/", post(start_upload))
        .route(
            "/v2/library/:name/blobs/uploads/:id",
            patch(patch_upload).put(finish_upload),
        )
        .route("/v2/library/:name/blobs/:digest", get(get_blob).head(head_blob))
        .layer(middleware::from_fn_with_state(stub.clone(), auth_layer))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    *stub.addr.lock().unwrap() = Some(addr);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, addr.to_string())
}

/// Register a one-layer model with the stub, returning the weights digest.
fn seed_stub_model(stub: &Stub, name: &str, weights: &[u8]) -> String {
    let config = br#"{"model_format":"gguf"}"#.to_vec();
    let config_digest = digest_bytes(&config);
    let weights_digest = digest_bytes(weights);

    let manifest = Manifest::new(
        Layer {
            media_type: mediatype::CONFIG.to_string(),
            digest: config_digest.clone(),
            size: config.len() as u64,
        },
        vec![Layer {
            media_type: mediatype::MODEL.to_string(),
            digest: weights_digest.clone(),
            size: weights.len() as u64,
        }],
    );

    let mut blobs = stub.blobs.lock().unwrap();
    blobs.insert(config_digest, config);
    blobs.insert(weights_digest.clone(), weights.to_vec());
    stub.manifests.lock().unwrap().insert(
        format!("{name}:latest"),
        serde_json::to_string(&manifest).unwrap(),
    );
    weights_digest
}

fn client_for(dir: &tempfile::TempDir) -> (Arc<ModelStore>, RegistryClient) {
    let store = Arc::new(ModelStore::new(dir.path().join("models")).unwrap());
    let client = RegistryClient::new(store.clone()).unwrap();
    (store, client)
}

fn no_progress() -> impl Fn(Progress) + Send + Sync {
    |_| {}
}

#[tokio::test]
async fn pull_fetches_manifest_and_blobs() {
    let (stub, addr) = start_stub(None).await;
    let weights = vec![1u8; 256 * 1024];
    let digest = seed_stub_model(&stub, "m", &weights);

    let dir = tempfile::tempdir().unwrap();
    let (store, client) = client_for(&dir);
    let reference = ModelRef::parse(&format!("{addr}/library/m")).unwrap();
    let auth = RegistryAuth {
        insecure: true,
        ..RegistryAuth::default()
    };

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let captured = statuses.clone();
    client
        .pull(&reference, &auth, &CancellationToken::new(), &move |p| {
            captured.lock().unwrap().push(p.status);
        })
        .await
        .unwrap();

    assert!(store.has_blob(&digest));
    assert!(store.has_manifest(&reference));
    let statuses = statuses.lock().unwrap();
    assert_eq!(statuses.last().unwrap(), "success");
    assert!(statuses.iter().any(|s| s == "verifying sha256"));
    assert!(statuses.iter().any(|s| s == "writing manifest"));
    assert!(statuses.iter().any(|s| s.starts_with("downloading ")));
}

#[tokio::test]
async fn interrupted_pull_resumes_from_the_partial_file() {
    let (stub, addr) = start_stub(None).await;
    let weights: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let digest = seed_stub_model(&stub, "m", &weights);

    let dir = tempfile::tempdir().unwrap();
    let (store, client) = client_for(&dir);

    // Simulate a transfer that died 300 kB in: the partial file is already
    // on disk next to where the blob will land.
    let partial_len = 300_000usize;
    let mut partial = store.blob_path(&digest).into_os_string();
    partial.push("-partial");
    std::fs::write(&partial, &weights[..partial_len]).unwrap();

    let reference = ModelRef::parse(&format!("{addr}/library/m")).unwrap();
    let auth = RegistryAuth {
        insecure: true,
        ..RegistryAuth::default()
    };
    client
        .pull(&reference, &auth, &CancellationToken::new(), &no_progress())
        .await
        .unwrap();

    assert!(store.has_blob(&digest));
    let stored = std::fs::read(store.blob_path(&digest)).unwrap();
    assert_eq!(stored, weights);

    // The weights request picked up where the partial file ended.
    let offsets = stub.range_offsets.lock().unwrap();
    assert!(
        offsets.contains(&(partial_len as u64)),
        "no resumed request seen in {offsets:?}"
    );
}

#[tokio::test]
async fn corrupted_blobs_fail_and_clean_up() {
    let (stub, addr) = start_stub(None).await;
    let weights = vec![9u8; 64 * 1024];
    let digest = seed_stub_model(&stub, "m", &weights);
    // Corrupt the stored bytes after the digest was computed.
    stub.blobs
        .lock()
        .unwrap()
        .insert(digest.clone(), vec![0u8; 64 * 1024]);

    let dir = tempfile::tempdir().unwrap();
    let (store, client) = client_for(&dir);
    let reference = ModelRef::parse(&format!("{addr}/library/m")).unwrap();
    let auth = RegistryAuth {
        insecure: true,
        ..RegistryAuth::default()
    };

    let err = client
        .pull(&reference, &auth, &CancellationToken::new(), &no_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, ollamad::Error::DigestMismatch { .. }));

    // The bad partial is gone, so the next pull starts clean.
    assert!(!store.has_blob(&digest));
    let mut partial = store.blob_path(&digest).into_os_string();
    partial.push("-partial");
    assert!(!std::path::Path::new(&partial).exists());
}

#[tokio::test]
async fn pull_answers_a_bearer_challenge() {
    let (stub, addr) = start_stub(Some("sesame".to_string())).await;
    let weights = vec![3u8; 32 * 1024];
    let digest = seed_stub_model(&stub, "m", &weights);

    let dir = tempfile::tempdir().unwrap();
    let (store, client) = client_for(&dir);
    let reference = ModelRef::parse(&format!("{addr}/library/m")).unwrap();
    let auth = RegistryAuth {
        username: Some("alice".to_string()),
        password: Some("hunter2".to_string()),
        insecure: true,
    };

    client
        .pull(&reference, &auth, &CancellationToken::new(), &no_progress())
        .await
        .unwrap();
    assert!(store.has_blob(&digest));
}

#[tokio::test]
async fn push_uploads_missing_blobs_and_the_manifest() {
    let (stub, addr) = start_stub(None).await;

    let dir = tempfile::tempdir().unwrap();
    let (store, client) = client_for(&dir);

    // A local model the stub has never seen.
    let weights = vec![5u8; 128 * 1024];
    let (weights_digest, weights_size) = store
        .put_blob(std::io::Cursor::new(weights.clone()))
        .unwrap();
    let config = br#"{"model_format":"gguf"}"#.to_vec();
    let (config_digest, config_size) = store
        .put_blob(std::io::Cursor::new(config))
        .unwrap();
    let reference = ModelRef::parse(&format!("{addr}/library/m")).unwrap();
    let manifest = Manifest::new(
        Layer {
            media_type: mediatype::CONFIG.to_string(),
            digest: config_digest,
            size: config_size,
        },
        vec![Layer {
            media_type: mediatype::MODEL.to_string(),
            digest: weights_digest.clone(),
            size: weights_size,
        }],
    );
    store.write_manifest(&reference, &manifest).unwrap();

    let auth = RegistryAuth {
        insecure: true,
        ..RegistryAuth::default()
    };
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let captured = statuses.clone();
    client
        .push(&reference, &auth, &CancellationToken::new(), &move |p| {
            captured.lock().unwrap().push(p.status);
        })
        .await
        .unwrap();

    assert_eq!(
        stub.blobs.lock().unwrap().get(&weights_digest),
        Some(&weights)
    );
    assert!(stub
        .manifests
        .lock()
        .unwrap()
        .contains_key("m:latest"));
    assert_eq!(statuses.lock().unwrap().last().unwrap(), "success");
}
