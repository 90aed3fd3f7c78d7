//! On-disk model storage: content-addressed blobs under `<root>/blobs/` and
//! JSON manifests under `<root>/manifests/<registry>/<namespace>/<name>/<tag>`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::names::ModelRef;

pub mod mediatype {
    pub const CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MODEL: &str = "application/vnd.ollama.image.model";
    pub const ADAPTER: &str = "application/vnd.ollama.image.adapter";
    pub const TEMPLATE: &str = "application/vnd.ollama.image.template";
    pub const SYSTEM: &str = "application/vnd.ollama.image.system";
    pub const PARAMS: &str = "application/vnd.ollama.image.params";
    pub const LICENSE: &str = "application/vnd.ollama.image.license";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Layer,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Manifest {
    pub fn new(config: Layer, layers: Vec<Layer>) -> Self {
        Manifest {
            schema_version: 2,
            media_type: mediatype::MANIFEST.to_string(),
            config,
            layers,
        }
    }

    /// Config blob plus every layer, in manifest order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Layer> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    pub fn total_size(&self) -> u64 {
        self.descriptors().map(|l| l.size).sum()
    }

    pub fn layer(&self, media_type: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.media_type == media_type)
    }
}

/// One entry from a manifest listing.
pub struct ListedModel {
    pub reference: ModelRef,
    pub manifest: Manifest,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
}

/// A model reference resolved against its local manifest: everything the
/// inference side needs, recomputed per request.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub reference: ModelRef,
    pub model_path: PathBuf,
    pub adapter_paths: Vec<PathBuf>,
    pub template: Option<String>,
    pub system: Option<String>,
    pub params: Option<String>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("manifests"))?;
        Ok(ModelStore { root })
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    /// Digest strings are `sha256:<hex>`; file names use `sha256-<hex>`.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(digest.replacen(':', "-", 1))
    }

    pub fn manifest_path(&self, reference: &ModelRef) -> PathBuf {
        let mut path = self.manifests_dir();
        for part in reference.manifest_components() {
            path.push(part);
        }
        path
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    pub fn blob_size(&self, digest: &str) -> Result<u64> {
        let meta = fs::metadata(self.blob_path(digest))
            .map_err(|_| Error::NotFound(format!("blob {digest}")))?;
        Ok(meta.len())
    }

    pub fn open_blob(&self, digest: &str) -> Result<File> {
        File::open(self.blob_path(digest)).map_err(|_| Error::NotFound(format!("blob {digest}")))
    }

    pub fn read_blob_string(&self, digest: &str) -> Result<String> {
        let mut out = String::new();
        self.open_blob(digest)?.read_to_string(&mut out)?;
        Ok(out)
    }

    /// A unique scratch path on the same filesystem as the blob directory,
    /// so the final rename is atomic.
    pub fn temp_blob_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.blobs_dir()
            .join(format!(".tmp-{}-{}", std::process::id(), n))
    }

    /// Stream `reader` into the store, computing the digest on the way.
    /// Returns the digest and size of the stored blob.
    pub fn put_blob(&self, mut reader: impl Read) -> Result<(String, u64)> {
        let temp = self.temp_blob_path();
        let mut file = File::create(&temp)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            size += n as u64;
        }
        file.sync_all()?;
        drop(file);

        let digest = format!("sha256:{:x}", hasher.finalize());
        self.commit_blob(&temp, &digest)?;
        Ok((digest, size))
    }

    /// Move a fully-written temp file into place under its digest. If the
    /// blob already exists the temp file is discarded.
    pub fn commit_blob(&self, temp: &Path, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.is_file() {
            let _ = fs::remove_file(temp);
            return Ok(());
        }
        fs::rename(temp, &path)?;
        Ok(())
    }

    /// Write a manifest for `reference`. Every referenced blob must already
    /// be present locally.
    pub fn write_manifest(&self, reference: &ModelRef, manifest: &Manifest) -> Result<()> {
        for desc in manifest.descriptors() {
            if !self.has_blob(&desc.digest) {
                return Err(Error::Internal(format!(
                    "manifest for {reference} references missing blob {}",
                    desc.digest
                )));
            }
        }

        let path = self.manifest_path(reference);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename keeps concurrent readers off partial manifests.
        let temp = path.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&temp, serde_json::to_vec(manifest)?)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    pub fn read_manifest(&self, reference: &ModelRef) -> Result<Manifest> {
        let path = self.manifest_path(reference);
        let content = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("model {}", reference.short_name())))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn has_manifest(&self, reference: &ModelRef) -> bool {
        self.manifest_path(reference).is_file()
    }

    /// Walk the manifests tree and return every stored model.
    pub fn list(&self) -> Result<Vec<ListedModel>> {
        let mut models = Vec::new();
        let root = self.manifests_dir();
        self.walk_manifests(&root, &mut models)?;
        models.sort_by(|a, b| a.reference.short_name().cmp(&b.reference.short_name()));
        Ok(models)
    }

    fn walk_manifests(&self, dir: &Path, models: &mut Vec<ListedModel>) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.walk_manifests(&path, models)?;
                continue;
            }

            let root = self.manifests_dir();
            let relative = match path.strip_prefix(&root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            // Expect registry/namespace/name/tag; skip stray files.
            if parts.len() != 4 {
                continue;
            }

            let reference = ModelRef {
                registry: parts[0].clone(),
                namespace: parts[1].clone(),
                name: parts[2].clone(),
                tag: parts[3].clone(),
            };
            let manifest: Manifest = match serde_json::from_str(&fs::read_to_string(&path)?) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified_at = fs::metadata(&path)?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let size = manifest.total_size();
            models.push(ListedModel {
                reference,
                manifest,
                modified_at,
                size,
            });
        }
        Ok(())
    }

    /// Delete a manifest by tag, then garbage-collect any blob no remaining
    /// manifest references. The reference count is a scan, not an index.
    pub fn delete(&self, reference: &ModelRef) -> Result<()> {
        let manifest = self.read_manifest(reference)?;
        let path = self.manifest_path(reference);
        fs::remove_file(&path)?;
        self.prune_empty_dirs(path.parent());

        let still_referenced = self.referenced_digests()?;
        for desc in manifest.descriptors() {
            if !still_referenced.contains(&desc.digest) {
                let blob = self.blob_path(&desc.digest);
                if blob.is_file() {
                    debug!(digest = %desc.digest, "removing unreferenced blob");
                    fs::remove_file(blob)?;
                }
            }
        }
        Ok(())
    }

    /// Re-tag `src` as `dst` by copying the manifest. Blobs are shared.
    pub fn copy(&self, src: &ModelRef, dst: &ModelRef) -> Result<()> {
        let manifest = self.read_manifest(src)?;
        self.write_manifest(dst, &manifest)
    }

    fn referenced_digests(&self) -> Result<HashSet<String>> {
        let mut digests = HashSet::new();
        for model in self.list()? {
            for desc in model.manifest.descriptors() {
                digests.insert(desc.digest.clone());
            }
        }
        Ok(digests)
    }

    fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        let root = self.manifests_dir();
        while let Some(d) = dir {
            if d == root || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Read a manifest and materialise the in-memory model view: blob paths
    /// for weights and adapters plus the text layers.
    pub fn resolve(&self, reference: &ModelRef) -> Result<ResolvedModel> {
        let manifest = self.read_manifest(reference)?;

        let mut model_path = None;
        let mut adapter_paths = Vec::new();
        let mut template = None;
        let mut system = None;
        let mut params = None;

        for layer in &manifest.layers {
            match layer.media_type.as_str() {
                mediatype::MODEL => {
                    let path = self.blob_path(&layer.digest);
                    if !path.is_file() {
                        return Err(Error::NotFound(format!("blob {}", layer.digest)));
                    }
                    model_path = Some(path);
                }
                mediatype::ADAPTER => adapter_paths.push(self.blob_path(&layer.digest)),
                mediatype::TEMPLATE => template = Some(self.read_blob_string(&layer.digest)?),
                mediatype::SYSTEM => system = Some(self.read_blob_string(&layer.digest)?),
                mediatype::PARAMS => params = Some(self.read_blob_string(&layer.digest)?),
                _ => {}
            }
        }

        let model_path = model_path.ok_or_else(|| {
            Error::NotFound(format!("model weights for {}", reference.short_name()))
        })?;

        Ok(ResolvedModel {
            reference: reference.clone(),
            model_path,
            adapter_paths,
            template,
            system,
            params,
        })
    }
}

/// Digest of an in-memory byte slice, in `sha256:<hex>` form.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, ModelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn text_layer(store: &ModelStore, media_type: &str, text: &str) -> Layer {
        let (digest, size) = store.put_blob(Cursor::new(text.as_bytes().to_vec())).unwrap();
        Layer {
            media_type: media_type.to_string(),
            digest,
            size,
        }
    }

    #[test]
    fn put_blob_is_content_addressed() {
        let (_dir, store) = store();
        let (digest, size) = store.put_blob(Cursor::new(b"hello world".to_vec())).unwrap();
        assert_eq!(size, 11);
        assert_eq!(digest, digest_bytes(b"hello world"));
        assert!(store.has_blob(&digest));

        // A second write of the same content is a no-op.
        let (digest2, _) = store.put_blob(Cursor::new(b"hello world".to_vec())).unwrap();
        assert_eq!(digest, digest2);
    }

    #[test]
    fn write_manifest_requires_blobs() {
        let (_dir, store) = store();
        let config = text_layer(&store, mediatype::CONFIG, "{}");
        let missing = Layer {
            media_type: mediatype::MODEL.to_string(),
            digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .to_string(),
            size: 1,
        };
        let reference = ModelRef::parse("m1").unwrap();
        let err = store
            .write_manifest(&reference, &Manifest::new(config, vec![missing]))
            .unwrap_err();
        assert!(err.to_string().contains("missing blob"));
    }

    #[test]
    fn delete_collects_unshared_blobs() {
        let (_dir, store) = store();
        let config = text_layer(&store, mediatype::CONFIG, "{}");
        let shared = text_layer(&store, mediatype::MODEL, "weights");
        let only_m1 = text_layer(&store, mediatype::SYSTEM, "you are m1");

        let m1 = ModelRef::parse("m1").unwrap();
        let m2 = ModelRef::parse("m2").unwrap();
        store
            .write_manifest(
                &m1,
                &Manifest::new(config.clone(), vec![shared.clone(), only_m1.clone()]),
            )
            .unwrap();
        store
            .write_manifest(&m2, &Manifest::new(config.clone(), vec![shared.clone()]))
            .unwrap();

        store.delete(&m1).unwrap();

        assert!(!store.has_manifest(&m1));
        assert!(!store.has_blob(&only_m1.digest));
        // Still referenced by m2.
        assert!(store.has_blob(&shared.digest));
        assert!(store.has_blob(&config.digest));
    }

    #[test]
    fn copy_shares_blobs() {
        let (_dir, store) = store();
        let config = text_layer(&store, mediatype::CONFIG, "{}");
        let weights = text_layer(&store, mediatype::MODEL, "weights");
        let src = ModelRef::parse("src").unwrap();
        let dst = ModelRef::parse("dst:v2").unwrap();
        store
            .write_manifest(&src, &Manifest::new(config, vec![weights]))
            .unwrap();

        store.copy(&src, &dst).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reference.short_name(), "dst:v2");
        assert!(listed[0].size > 0);
    }

    #[test]
    fn resolve_reads_text_layers() {
        let (_dir, store) = store();
        let config = text_layer(&store, mediatype::CONFIG, "{}");
        let weights = text_layer(&store, mediatype::MODEL, "weights");
        let system = text_layer(&store, mediatype::SYSTEM, "be brief");
        let reference = ModelRef::parse("m1").unwrap();
        store
            .write_manifest(&reference, &Manifest::new(config, vec![weights, system]))
            .unwrap();

        let resolved = store.resolve(&reference).unwrap();
        assert!(resolved.model_path.is_file());
        assert_eq!(resolved.system.as_deref(), Some("be brief"));
        assert!(resolved.template.is_none());
    }
}
