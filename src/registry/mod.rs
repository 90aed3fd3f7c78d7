//! Registry client: moves blobs and manifests between the local store and a
//! remote content-addressed registry. Downloads resume from partial files,
//! concurrent pulls of the same blob share one transfer, and both directions
//! honour cancellation between chunks.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::names::ModelRef;
use crate::store::{mediatype, Manifest, ModelStore};

const MAX_RETRIES: u32 = 3;
const UPLOAD_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Per-operation registry credentials; never persisted.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
}

/// One progress update on a pull or push stream.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl Progress {
    pub fn status(status: impl Into<String>) -> Self {
        Progress {
            status: status.into(),
            digest: None,
            total: None,
            completed: None,
        }
    }

    fn transfer(status: String, digest: &str, total: u64, completed: u64) -> Self {
        Progress {
            status,
            digest: Some(digest.to_string()),
            total: Some(total),
            completed: Some(completed),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// A transfer some caller is already running; followers subscribe to its
/// progress instead of downloading the same bytes twice.
struct InFlight {
    total: u64,
    // (completed bytes, finished)
    state: watch::Sender<(u64, bool)>,
}

pub struct RegistryClient {
    client: reqwest::Client,
    store: Arc<ModelStore>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl RegistryClient {
    pub fn new(store: Arc<ModelStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(30))
            .build()?;
        Ok(RegistryClient {
            client,
            store,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, reference: &ModelRef, auth: &RegistryAuth) -> String {
        let scheme = if auth.insecure { "http" } else { "https" };
        format!(
            "{scheme}://{}/v2/{}",
            reference.registry,
            reference.repository()
        )
    }

    /// Fetch a manifest and every blob it references, then write the
    /// manifest locally. Progress updates flow through `progress`.
    pub async fn pull(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        info!(model = %reference.short_name(), "pulling from registry");
        progress(Progress::status(format!(
            "pulling manifest for {}",
            reference.short_name()
        )));

        let manifest = self.fetch_manifest(reference, auth).await?;

        for desc in manifest.descriptors() {
            if self.store.has_blob(&desc.digest) {
                continue;
            }
            self.fetch_blob(reference, auth, &desc.digest, desc.size, cancel, progress)
                .await?;
        }

        progress(Progress::status("verifying sha256"));
        for desc in manifest.descriptors() {
            if self.store.blob_size(&desc.digest)? != desc.size {
                return Err(Error::DigestMismatch {
                    expected: desc.digest.clone(),
                    actual: "blob with unexpected size".to_string(),
                });
            }
        }

        progress(Progress::status("writing manifest"));
        self.store.write_manifest(reference, &manifest)?;
        progress(Progress::status("success"));
        Ok(())
    }

    /// Upload every missing blob then the manifest.
    pub async fn push(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        info!(model = %reference.short_name(), "pushing to registry");
        let manifest = self.store.read_manifest(reference)?;

        for desc in manifest.descriptors() {
            if self.blob_exists(reference, auth, &desc.digest).await? {
                progress(Progress::transfer(
                    format!("pushing {}", short_digest(&desc.digest)),
                    &desc.digest,
                    desc.size,
                    desc.size,
                ));
                continue;
            }
            self.upload_blob(reference, auth, &desc.digest, desc.size, cancel, progress)
                .await?;
        }

        progress(Progress::status("pushing manifest"));
        let url = format!("{}/manifests/{}", self.base_url(reference, auth), reference.tag);
        let body = serde_json::to_vec(&manifest)?;
        let resp = self
            .send_authed(reference, auth, || {
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, mediatype::MANIFEST)
                    .body(body.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "manifest push failed: {}",
                resp.status()
            )));
        }

        progress(Progress::status("success"));
        Ok(())
    }

    pub async fn fetch_manifest(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
    ) -> Result<Manifest> {
        let url = format!("{}/manifests/{}", self.base_url(reference, auth), reference.tag);
        let resp = self
            .send_authed(reference, auth, || {
                self.client.get(&url).header(ACCEPT, mediatype::MANIFEST)
            })
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!(
                "model {}",
                reference.short_name()
            ))),
            s if s.is_success() => Ok(resp.json().await?),
            s => Err(Error::Network(format!("manifest fetch failed: {s}"))),
        }
    }

    /// Download one blob, deduplicating against transfers already in flight.
    async fn fetch_blob(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        digest: &str,
        total: u64,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        let (inflight, leader) = {
            let mut map = self.in_flight.lock();
            match map.get(digest) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let (state, _) = watch::channel((0u64, false));
                    let entry = Arc::new(InFlight { total, state });
                    map.insert(digest.to_string(), entry.clone());
                    (entry, true)
                }
            }
        };

        if !leader {
            return self
                .follow_transfer(&inflight, digest, cancel, progress)
                .await;
        }

        let result = self
            .download_blob(reference, auth, digest, total, &inflight, cancel, progress)
            .await;

        let completed = inflight.state.borrow().0;
        let _ = inflight.state.send((completed, true));
        self.in_flight.lock().remove(digest);
        result
    }

    /// Attach to another caller's transfer and relay its progress.
    async fn follow_transfer(
        &self,
        inflight: &InFlight,
        digest: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        let status = format!("downloading {}", short_digest(digest));
        let mut rx = inflight.state.subscribe();
        loop {
            let (completed, finished) = *rx.borrow_and_update();
            progress(Progress::transfer(
                status.clone(),
                digest,
                inflight.total,
                completed,
            ));
            if finished {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if self.store.has_blob(digest) {
            Ok(())
        } else {
            Err(Error::Network(format!(
                "shared transfer of {digest} failed"
            )))
        }
    }

    async fn download_blob(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        digest: &str,
        total: u64,
        inflight: &InFlight,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        let partial = self.partial_path(digest);
        let url = format!("{}/blobs/{digest}", self.base_url(reference, auth));

        let mut attempt = 0u32;
        loop {
            let result = self
                .download_attempt(&url, reference, auth, digest, total, &partial, inflight, cancel, progress)
                .await;
            match result {
                Ok(()) => break,
                Err(Error::Network(reason)) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * (1 << attempt));
                    warn!(%reason, attempt, "blob download failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Verify the digest computed over everything on disk.
        let (hasher, size) = hash_partial(&partial)?;
        let computed = format!("sha256:{:x}", hasher.finalize());
        if computed != digest || size != total {
            let _ = fs::remove_file(&partial);
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }
        self.store.commit_blob(&partial, digest)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_attempt(
        &self,
        url: &str,
        reference: &ModelRef,
        auth: &RegistryAuth,
        digest: &str,
        total: u64,
        partial: &Path,
        inflight: &InFlight,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        // Resume from whatever a previous attempt left behind.
        let mut offset = fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
        if offset >= total && total > 0 {
            return Ok(());
        }

        let resp = self
            .send_authed(reference, auth, || {
                self.client
                    .get(url)
                    .header(RANGE, format!("bytes={offset}-"))
            })
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Network(format!("blob fetch failed: {status}")));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(partial)?;
        if status != StatusCode::PARTIAL_CONTENT && offset > 0 {
            // The registry ignored the range request; start over.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            offset = 0;
        }

        let label = format!("downloading {}", short_digest(digest));
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                // The partial file stays behind so the next pull resumes.
                return Err(Error::Canceled);
            }
            let chunk = chunk?;
            file.write_all(&chunk)?;
            offset += chunk.len() as u64;
            let _ = inflight.state.send((offset, false));
            progress(Progress::transfer(label.clone(), digest, total, offset));
        }
        file.sync_all()?;
        Ok(())
    }

    async fn blob_exists(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        digest: &str,
    ) -> Result<bool> {
        let url = format!("{}/blobs/{digest}", self.base_url(reference, auth));
        let resp = self
            .send_authed(reference, auth, || self.client.head(&url))
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::Network(format!("blob stat failed: {s}"))),
        }
    }

    async fn upload_blob(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        digest: &str,
        total: u64,
        cancel: &CancellationToken,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<()> {
        let start_url = format!("{}/blobs/uploads/", self.base_url(reference, auth));
        let resp = self
            .send_authed(reference, auth, || self.client.post(&start_url))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "upload session failed: {}",
                resp.status()
            )));
        }
        let mut location = self.upload_location(reference, auth, &resp)?;

        let label = format!("pushing {}", short_digest(digest));
        let mut blob = self.store.open_blob(digest)?;
        let mut sent = 0u64;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];

        while sent < total {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let n = blob.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = buf[..n].to_vec();
            let range = format!("{}-{}", sent, sent + n as u64 - 1);

            let mut attempt = 0u32;
            loop {
                let resp = self
                    .send_authed(reference, auth, || {
                        self.client
                            .patch(&location)
                            .header(CONTENT_LENGTH, n)
                            .header("Content-Range", range.clone())
                            .body(chunk.clone())
                    })
                    .await;
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        if let Ok(next) = self.upload_location(reference, auth, &resp) {
                            location = next;
                        }
                        break;
                    }
                    Ok(resp) if attempt + 1 >= MAX_RETRIES => {
                        return Err(Error::Network(format!(
                            "chunk upload failed: {}",
                            resp.status()
                        )));
                    }
                    Err(e) if attempt + 1 >= MAX_RETRIES => return Err(e),
                    _ => {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
                    }
                }
            }

            sent += n as u64;
            progress(Progress::transfer(label.clone(), digest, total, sent));
        }

        // Finalise the session with the digest.
        let sep = if location.contains('?') { '&' } else { '?' };
        let finalize = format!("{location}{sep}digest={digest}");
        let resp = self
            .send_authed(reference, auth, || self.client.put(&finalize))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "upload finalise failed: {}",
                resp.status()
            )));
        }
        debug!(digest, "uploaded blob");
        Ok(())
    }

    /// The next upload URL from a `Location` header, resolved against the
    /// registry host when relative.
    fn upload_location(
        &self,
        reference: &ModelRef,
        auth: &RegistryAuth,
        resp: &Response,
    ) -> Result<String> {
        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Network("upload response missing Location".to_string()))?;
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(location.to_string());
        }
        let scheme = if auth.insecure { "http" } else { "https" };
        Ok(format!("{scheme}://{}{location}", reference.registry))
    }

    /// Issue a request, answering one bearer-token challenge before giving
    /// up on authorisation.
    async fn send_authed(
        &self,
        _reference: &ModelRef,
        auth: &RegistryAuth,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Response> {
        let resp = build().send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(parse_challenge)
            .unwrap_or_default();
        let realm = challenge
            .get("realm")
            .ok_or_else(|| Error::AuthFailed("registry sent no token challenge".to_string()))?;

        let mut token_req = self.client.get(realm);
        if let Some(service) = challenge.get("service") {
            token_req = token_req.query(&[("service", service)]);
        }
        if let Some(scope) = challenge.get("scope") {
            token_req = token_req.query(&[("scope", scope)]);
        }
        if let Some(username) = &auth.username {
            token_req = token_req.basic_auth(username, auth.password.as_ref());
        }

        let token_resp = token_req.send().await?;
        if !token_resp.status().is_success() {
            return Err(Error::AuthFailed(format!(
                "token endpoint returned {}",
                token_resp.status()
            )));
        }
        let token: TokenResponse = token_resp.json().await?;

        let retried = build()
            .header(AUTHORIZATION, format!("Bearer {}", token.token))
            .send()
            .await?;
        match retried.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthFailed(format!(
                "registry rejected credentials: {}",
                retried.status()
            ))),
            _ => Ok(retried),
        }
    }

    fn partial_path(&self, digest: &str) -> PathBuf {
        let mut path = self.store.blob_path(digest).into_os_string();
        path.push("-partial");
        PathBuf::from(path)
    }
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

fn hash_partial(path: &Path) -> Result<(Sha256, u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok((hasher, size));
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let rest = header.strip_prefix("Bearer ").unwrap_or(header);
    for pair in rest.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parsing() {
        let fields = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry",scope="repository:library/m:pull""#,
        );
        assert_eq!(fields["realm"], "https://auth.example.com/token");
        assert_eq!(fields["service"], "registry");
        assert_eq!(fields["scope"], "repository:library/m:pull");
    }

    #[test]
    fn short_digest_trims_the_prefix() {
        assert_eq!(short_digest("sha256:abcdef0123456789aa"), "abcdef012345");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn progress_serialises_sparsely() {
        let p = Progress::status("success");
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"status":"success"}"#);
    }
}
