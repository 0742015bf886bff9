use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::digest::{Digest, Hasher};
use crate::error::{OciError, Result};
use crate::manifest::{Descriptor, Index, ANNOTATION_REF_NAME};

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

const INDEX_LOCK_FILE: &str = "index.json.lock";
const LOCK_POLL: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

// ---------------------------------------------------------------------------
// OciLayout
// ---------------------------------------------------------------------------

/// A content-addressable store in the OCI Image Layout directory format:
/// `oci-layout`, `index.json`, and `blobs/<algo>/<hex>`.
///
/// All file writes go through write-temp-plus-rename on the same
/// filesystem; `index.json` read-modify-write cycles are serialized by an
/// `index.json.lock` file so concurrent copies into one layout are safe.
#[derive(Debug)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Create the layout at `root` if needed; verify its version when it
    /// already exists.
    pub async fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        set_dir_permissions(&root).await;

        let marker = root.join(OCI_LAYOUT_FILE);
        if fs::try_exists(&marker).await? {
            verify_marker(&marker).await?;
        } else {
            let body = serde_json::to_vec(&LayoutMarker {
                image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
            })?;
            write_atomic(&marker, &body).await?;
        }

        let index_path = root.join(INDEX_FILE);
        if !fs::try_exists(&index_path).await? {
            let body = serde_json::to_vec_pretty(&Index::new(Vec::new()))?;
            write_atomic(&index_path, &body).await?;
        }

        debug!(root = %root.display(), "layout ready");
        Ok(Self { root })
    }

    /// Open an existing layout, failing when it is missing or declares an
    /// unknown version.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let marker = root.join(OCI_LAYOUT_FILE);
        if !fs::try_exists(&marker).await? {
            return Err(OciError::NotFound(format!(
                "no oci-layout file under {}",
                root.display()
            )));
        }
        verify_marker(&marker).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `blobs/<algo>/<hex>` for a digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub async fn has_blob(&self, digest: &Digest) -> bool {
        fs::try_exists(self.blob_path(digest))
            .await
            .unwrap_or(false)
    }

    // -- blobs --------------------------------------------------------------

    /// Stream `reader` into the store, verifying the running digest.
    ///
    /// Writes land in `blobs/<algo>/<hex>.tmp` and are renamed on a digest
    /// match; a mismatch deletes the temp file.  When the blob is already
    /// present the write is skipped, but the reader is still drained so a
    /// network source is fully consumed.
    pub async fn put_blob<R>(&self, digest: &Digest, mut reader: R) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin,
    {
        let final_path = self.blob_path(digest);
        if fs::try_exists(&final_path).await? {
            debug!(%digest, "blob already stored, draining source");
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Ok(final_path);
        }

        let dir = final_path.parent().expect("blob path has a parent");
        fs::create_dir_all(dir).await?;
        set_dir_permissions(dir).await;

        let tmp_path = dir.join(format!("{}.tmp", digest.hex()));
        let mut tmp = fs::File::create(&tmp_path).await?;
        let mut hasher = Hasher::new(digest.algorithm());
        let mut buf = vec![0u8; WRITE_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    drop(tmp);
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if let Err(e) = tmp.write_all(&buf[..n]).await {
                drop(tmp);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        }
        if let Err(e) = tmp.flush().await {
            drop(tmp);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        drop(tmp);

        let actual = hasher.finalize();
        if actual != *digest {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        set_file_permissions(&tmp_path).await;
        rename_replacing(&tmp_path, &final_path).await?;
        debug!(%digest, path = %final_path.display(), "stored blob");
        Ok(final_path)
    }

    /// Store an in-memory blob.
    pub async fn put_blob_bytes(&self, digest: &Digest, bytes: &[u8]) -> Result<PathBuf> {
        self.put_blob(digest, bytes).await
    }

    /// Open a blob for reading.  Missing blobs are `NotFound`.
    pub async fn get_blob(&self, digest: &Digest) -> Result<fs::File> {
        fs::File::open(self.blob_path(digest)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciError::NotFound(digest.to_string())
            } else {
                e.into()
            }
        })
    }

    /// Read a whole blob into memory.
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut file = self.get_blob(digest).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }

    // -- index --------------------------------------------------------------

    pub async fn read_index(&self) -> Result<Index> {
        let bytes = fs::read(self.root.join(INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Register a top-level descriptor in `index.json`.
    ///
    /// A tagged entry re-points the tag: any existing entry whose
    /// `ref.name` annotation equals `ref_name` is removed first.  Untagged
    /// descriptors are appended without the annotation and deduplicated by
    /// digest.
    pub async fn add_manifest_to_index(
        &self,
        descriptor: &Descriptor,
        ref_name: Option<&str>,
    ) -> Result<()> {
        let _lock = IndexLock::acquire(self.root.join(INDEX_LOCK_FILE)).await?;

        let mut index = self.read_index().await?;
        let mut entry = descriptor.clone();
        match ref_name {
            Some(tag) => {
                entry = entry.with_annotation(ANNOTATION_REF_NAME, tag);
                index.manifests.retain(|d| d.ref_name() != Some(tag));
                index.manifests.push(entry);
            }
            None => {
                if let Some(annotations) = entry.annotations.as_mut() {
                    annotations.remove(ANNOTATION_REF_NAME);
                    if annotations.is_empty() {
                        entry.annotations = None;
                    }
                }
                if !index.manifests.iter().any(|d| d.digest == entry.digest) {
                    index.manifests.push(entry);
                }
            }
        }

        let body = serde_json::to_vec_pretty(&index)?;
        write_atomic(&self.root.join(INDEX_FILE), &body).await
    }

    /// Look up a top-level descriptor by tag (`ref.name` annotation) or by
    /// digest string.
    pub async fn resolve_ref(&self, tag_or_digest: &str) -> Result<Descriptor> {
        let index = self.read_index().await?;
        index
            .manifests
            .iter()
            .find(|d| d.ref_name() == Some(tag_or_digest) || d.digest == tag_or_digest)
            .cloned()
            .ok_or_else(|| {
                OciError::NotFound(format!(
                    "{tag_or_digest} not present in {}",
                    self.root.join(INDEX_FILE).display()
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Index lock
// ---------------------------------------------------------------------------

/// Advisory lock file guarding the `index.json` read-modify-write window.
/// Acquisition is create_new with a bounded retry loop; locks older than
/// [`LOCK_STALE_AFTER`] are treated as leftovers of a crashed writer and
/// removed.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let _ = file.write_all(std::process::id().to_string().as_bytes()).await;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = fs::metadata(&path).await {
                        let age = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.elapsed().ok())
                            .unwrap_or_default();
                        if age > LOCK_STALE_AFTER {
                            debug!(path = %path.display(), "removing stale index lock");
                            let _ = fs::remove_file(&path).await;
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(e.into());
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

async fn verify_marker(path: &Path) -> Result<()> {
    let bytes = fs::read(path).await?;
    let marker: LayoutMarker = serde_json::from_slice(&bytes)
        .map_err(|e| OciError::IncompatibleLayout(format!("unparsable oci-layout file: {e}")))?;
    if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
        return Err(OciError::IncompatibleLayout(format!(
            "imageLayoutVersion {} (supported: {IMAGE_LAYOUT_VERSION})",
            marker.image_layout_version
        )));
    }
    Ok(())
}

/// Write-temp-plus-rename in the target's directory.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .expect("atomic write target has a file name")
        .to_string_lossy();
    let tmp = path.with_file_name(format!("{name}.tmp"));
    fs::write(&tmp, bytes).await?;
    set_file_permissions(&tmp).await;
    rename_replacing(&tmp, path).await
}

/// Rename, falling back to remove-then-rename for filesystems that refuse
/// to rename over an existing file.
async fn rename_replacing(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let _ = fs::remove_file(to).await;
    fs::rename(from, to).await.map_err(Into::into)
}

#[cfg(unix)]
async fn set_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await;
}

#[cfg(not(unix))]
async fn set_file_permissions(_path: &Path) {}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await;
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
