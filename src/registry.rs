use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderName, ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, StatusCode, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::credentials::{CredentialProvider, DockerConfigFile};
use crate::digest::{self, digest_bytes, Algorithm, Digest, Hasher};
use crate::error::{OciError, Result};
use crate::manifest::{
    empty_config_descriptor, is_index_media_type, is_manifest_media_type, manifest_accept_header,
    Descriptor, Index, Manifest, ManifestKind, TagList, ANNOTATION_TITLE, EMPTY_CONFIG_BYTES,
    MEDIA_TYPE_DEFAULT_LAYER, MEDIA_TYPE_OCI_INDEX,
};
use crate::reference::Reference;
use crate::transport::{Body, OutboundRequest, Transport, TransportConfig};

const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Default chunk size for chunked uploads.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

fn docker_content_digest_header() -> HeaderName {
    HeaderName::from_static("docker-content-digest")
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`Registry`].  The configuration is fixed once built.
pub struct RegistryBuilder {
    auth_provider: Option<Arc<dyn CredentialProvider>>,
    insecure: bool,
    context_path: String,
    connect_timeout: Duration,
    retry_attempts: u32,
    cancel: Option<CancellationToken>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            auth_provider: None,
            insecure: false,
            context_path: "/v2/".to_string(),
            connect_timeout: Duration::from_secs(30),
            retry_attempts: 5,
            cancel: None,
        }
    }

    /// Credential provider consulted per registry host.  Defaults to the
    /// docker config chain (`$DOCKER_CONFIG`, then `~/.docker`).
    pub fn auth_provider(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.auth_provider = Some(Arc::new(provider));
        self
    }

    /// Plain-HTTP mode: switches the scheme to `http` and disables TLS
    /// verification.  Off by default.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Override the API base path (default `/v2/`).
    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.context_path = path.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Maximum retry attempts for transient transport failures.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Cancellation token observed by every network operation.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let transport = Transport::new(&TransportConfig {
            insecure: self.insecure,
            connect_timeout: self.connect_timeout,
            retry_attempts: self.retry_attempts,
        })?;
        let provider = self
            .auth_provider
            .unwrap_or_else(|| Arc::new(DockerConfigFile::default_chain()));
        Ok(Registry {
            transport,
            auth: Authenticator::new(provider),
            context_path: self.context_path,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// OCI Distribution client.  Reentrant: one value may be shared across
/// caller threads; the only mutable state is the token cache inside the
/// auth negotiator.
pub struct Registry {
    transport: Transport,
    auth: Authenticator,
    context_path: String,
    cancel: CancellationToken,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OciError::Cancelled);
        }
        Ok(())
    }

    fn base_url(&self, host: &str) -> String {
        format!("{}://{}{}", self.transport.scheme(), host, self.context_path)
    }

    fn repo_url(&self, reference: &Reference, suffix: &str) -> String {
        format!(
            "{}{}/{}",
            self.base_url(reference.registry()),
            reference.repository(),
            suffix
        )
    }

    fn pull_scope(reference: &Reference) -> String {
        format!("repository:{}:pull", reference.repository())
    }

    fn push_scope(reference: &Reference) -> String {
        format!("repository:{}:pull,push", reference.repository())
    }

    async fn send(
        &self,
        reference: &Reference,
        scope: String,
        request: OutboundRequest,
    ) -> Result<Response> {
        self.check_cancelled()?;
        self.auth
            .send(&self.transport, reference.registry(), &scope, &request)
            .await
    }

    /// `GET /v2/` -- warms authentication and verifies the endpoint speaks
    /// the distribution API.
    pub async fn ping(&self, host: &str) -> Result<()> {
        let reference = Reference::for_registry(host);
        let url = self.base_url(host);
        let request = OutboundRequest::new(Method::GET, &url);
        let response = self.send(&reference, String::new(), request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected_status("GET", &url, response).await)
        }
    }

    // -- blobs --------------------------------------------------------------

    /// HEAD a blob.  `Some(descriptor)` when present (size from
    /// `Content-Length`), `None` on 404.
    pub async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<Option<Descriptor>> {
        let url = self.repo_url(reference, &format!("blobs/{digest}"));
        let request = OutboundRequest::new(Method::HEAD, &url);
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        match response.status() {
            StatusCode::OK => {
                if let Some(header) = header_str(&response, &docker_content_digest_header()) {
                    if header != digest.to_string() {
                        return Err(OciError::DigestMismatch {
                            expected: digest.to_string(),
                            actual: header,
                        });
                    }
                }
                let size = content_length(&response).unwrap_or(0);
                let media_type =
                    content_type_of(&response).unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.into());
                Ok(Some(Descriptor::new(media_type, digest, size)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected_status("HEAD", &url, response).await),
        }
    }

    /// Download a blob, streaming it through the digest engine into `out`.
    /// The computed digest must equal `digest` or the call fails.
    pub async fn pull_blob<W>(
        &self,
        reference: &Reference,
        digest: &Digest,
        mut out: W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let url = self.repo_url(reference, &format!("blobs/{digest}"));
        let request = OutboundRequest::new(Method::GET, &url);
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status("GET", &url, response).await);
        }

        let mut hasher = Hasher::new(digest.algorithm());
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            self.check_cancelled()?;
            let bytes = chunk.map_err(OciError::from)?;
            hasher.update(&bytes);
            out.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        out.flush().await?;
        digest::verify(digest, &hasher.finalize())?;
        debug!(%digest, bytes = written, "pulled blob");
        Ok(written)
    }

    /// Download a blob into memory.
    pub async fn pull_blob_bytes(&self, reference: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.pull_blob(reference, digest, &mut buf).await?;
        Ok(buf)
    }

    /// Open a blob as an async reader.  The caller is responsible for
    /// verifying the content digest of whatever it reads; [`OciLayout::put_blob`]
    /// does so when the reader is piped into a layout.
    ///
    /// [`OciLayout::put_blob`]: crate::layout::OciLayout::put_blob
    pub async fn blob_reader(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<impl tokio::io::AsyncRead + Unpin> {
        let url = self.repo_url(reference, &format!("blobs/{digest}"));
        let request = OutboundRequest::new(Method::GET, &url);
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status("GET", &url, response).await);
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(tokio_util::io::StreamReader::new(stream))
    }

    /// Upload a blob with a single monolithic PUT.  The blob is HEADed
    /// first and the upload skipped when it already exists.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        content: Body,
    ) -> Result<Descriptor> {
        if let Some(existing) = self.blob_exists(reference, digest).await? {
            debug!(%digest, "blob already present, skipping upload");
            return Ok(existing);
        }

        let size = body_size(&content).await?;
        let session = self.start_upload(reference, None).await?;
        let put_url = append_digest_query(&session, digest);
        let request = OutboundRequest::new(Method::PUT, put_url.as_str())
            .header(CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM)
            .body(content);
        let response = self
            .send(reference, Self::push_scope(reference), request)
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status("PUT", put_url.as_str(), response).await);
        }
        info!(%digest, size, "pushed blob");
        Ok(Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, size))
    }

    /// Upload a blob in chunks: PATCH each range to the session URL the
    /// server hands back, then finalize with an empty-body PUT.  A 416
    /// response resumes from the offset named in the server's `Range`
    /// header.
    pub async fn push_blob_chunked(
        &self,
        reference: &Reference,
        digest: &Digest,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<Descriptor> {
        if let Some(existing) = self.blob_exists(reference, digest).await? {
            debug!(%digest, "blob already present, skipping upload");
            return Ok(existing);
        }

        let chunk_size = chunk_size.max(1);
        let mut location = self.start_upload(reference, None).await?;
        let mut offset = 0usize;
        while offset < data.len() {
            self.check_cancelled()?;
            let end = (offset + chunk_size).min(data.len());
            let chunk = &data[offset..end];
            let request = OutboundRequest::new(Method::PATCH, location.as_str())
                .header(CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM)
                .header(CONTENT_RANGE, format!("{}-{}", offset, end - 1))
                .body(Body::Bytes(chunk.to_vec()));
            let response = self
                .send(reference, Self::push_scope(reference), request)
                .await?;
            match response.status() {
                StatusCode::ACCEPTED => {
                    location = resolve_location(&response)?;
                    offset = end;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    let range = header_str(&response, &reqwest::header::RANGE)
                        .ok_or_else(|| OciError::Transport {
                            status: Some(416),
                            message: format!(
                                "416 from {} without a Range header to resume from",
                                location
                            ),
                        })?;
                    offset = parse_range_end(&range)? as usize + 1;
                    if let Ok(loc) = resolve_location(&response) {
                        location = loc;
                    }
                    debug!(offset, "resuming chunked upload");
                }
                _ => return Err(unexpected_status("PATCH", location.as_str(), response).await),
            }
        }

        let put_url = append_digest_query(&location, digest);
        let request = OutboundRequest::new(Method::PUT, put_url.as_str());
        let response = self
            .send(reference, Self::push_scope(reference), request)
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status("PUT", put_url.as_str(), response).await);
        }
        info!(%digest, size = data.len(), "pushed blob (chunked)");
        Ok(Descriptor::new(
            MEDIA_TYPE_OCTET_STREAM,
            digest,
            data.len() as u64,
        ))
    }

    /// Cross-repository mount.  Returns the mounted descriptor, or `None`
    /// when the registry answered 202 (mount unsupported) and the caller
    /// must fall back to a regular upload.
    pub async fn mount_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        from_repository: &str,
    ) -> Result<Option<Descriptor>> {
        let response = self
            .start_upload_raw(reference, Some((digest, from_repository)))
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                info!(%digest, from = from_repository, "mounted blob");
                self.blob_exists(reference, digest).await
            }
            StatusCode::ACCEPTED => Ok(None),
            _ => {
                let url = self.repo_url(reference, "blobs/uploads/");
                Err(unexpected_status("POST", &url, response).await)
            }
        }
    }

    /// POST the upload endpoint and resolve the returned `Location`.
    async fn start_upload(
        &self,
        reference: &Reference,
        mount: Option<(&Digest, &str)>,
    ) -> Result<Url> {
        let response = self.start_upload_raw(reference, mount).await?;
        if response.status() != StatusCode::ACCEPTED {
            let url = self.repo_url(reference, "blobs/uploads/");
            return Err(unexpected_status("POST", &url, response).await);
        }
        resolve_location(&response)
    }

    async fn start_upload_raw(
        &self,
        reference: &Reference,
        mount: Option<(&Digest, &str)>,
    ) -> Result<Response> {
        let mut url = self.repo_url(reference, "blobs/uploads/");
        if let Some((digest, from)) = mount {
            url.push_str(&format!("?mount={digest}&from={from}"));
        }
        let request =
            OutboundRequest::new(Method::POST, &url).header(CONTENT_LENGTH, "0".to_string());
        self.send(reference, Self::push_scope(reference), request)
            .await
    }

    /// DELETE a blob.  405 means the registry does not allow deletes.
    pub async fn delete_blob(&self, reference: &Reference, digest: &Digest) -> Result<()> {
        let url = self.repo_url(reference, &format!("blobs/{digest}"));
        self.delete(reference, url).await
    }

    // -- manifests ----------------------------------------------------------

    /// HEAD the manifest addressed by `reference`.
    ///
    /// The response must carry a known manifest/index `Content-Type` and a
    /// `Docker-Content-Digest`; each missing or unusable header produces a
    /// specific [`OciError::InvalidManifestHeaders`].
    pub async fn head_manifest(&self, reference: &Reference) -> Result<(String, Descriptor)> {
        let url = self.repo_url(reference, &format!("manifests/{}", reference.resolvable()));
        let request =
            OutboundRequest::new(Method::HEAD, &url).header(ACCEPT, manifest_accept_header());
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status("HEAD", &url, response).await);
        }

        let content_type = content_type_of(&response).ok_or_else(|| {
            OciError::InvalidManifestHeaders("Content type not found in headers".to_string())
        })?;
        if !is_manifest_media_type(&content_type) && !is_index_media_type(&content_type) {
            return Err(OciError::InvalidManifestHeaders(format!(
                "Unsupported content type: {content_type}"
            )));
        }
        let digest = header_str(&response, &docker_content_digest_header()).ok_or_else(|| {
            OciError::InvalidManifestHeaders("Manifest digest not found in headers".to_string())
        })?;
        let digest = Digest::parse(&digest)?;
        let size = content_length(&response).unwrap_or(0);
        Ok((content_type.clone(), Descriptor::new(content_type, &digest, size)))
    }

    /// Resolve a reference to the descriptor of its manifest.
    pub async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        let (_, descriptor) = self.head_manifest(reference).await?;
        Ok(descriptor)
    }

    /// GET a manifest or index.  Returns the parsed document, its
    /// descriptor, and the raw bytes (which the descriptor digest covers).
    pub async fn pull_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(ManifestKind, Descriptor, Vec<u8>)> {
        let url = self.repo_url(reference, &format!("manifests/{}", reference.resolvable()));
        let request =
            OutboundRequest::new(Method::GET, &url).header(ACCEPT, manifest_accept_header());
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status("GET", &url, response).await);
        }

        let content_type = content_type_of(&response);
        let header_digest = header_str(&response, &docker_content_digest_header());
        let bytes = response.bytes().await.map_err(OciError::from)?.to_vec();

        let digest = match header_digest {
            Some(s) => Digest::parse(&s)?,
            None => digest_bytes(Algorithm::Sha256, &bytes),
        };
        let kind = ManifestKind::from_bytes(content_type.as_deref(), &bytes)?;
        let media_type = content_type.unwrap_or_else(|| kind.media_type().to_string());
        let descriptor = Descriptor::new(media_type, &digest, bytes.len() as u64);
        Ok((kind, descriptor, bytes))
    }

    /// PUT a manifest under the reference's tag (or digest).
    pub async fn push_manifest(
        &self,
        reference: &Reference,
        manifest: &ManifestKind,
    ) -> Result<Descriptor> {
        let bytes = manifest.to_bytes()?;
        self.push_manifest_bytes(reference, manifest.media_type(), bytes)
            .await
    }

    /// PUT raw manifest bytes with an explicit media type.  The digest in
    /// the registry's `Docker-Content-Digest` response header is
    /// authoritative for the uploaded bytes.
    pub async fn push_manifest_bytes(
        &self,
        reference: &Reference,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Descriptor> {
        let url = self.repo_url(reference, &format!("manifests/{}", reference.resolvable()));
        let size = bytes.len() as u64;
        let computed = digest_bytes(Algorithm::Sha256, &bytes);
        let request = OutboundRequest::new(Method::PUT, &url)
            .header(CONTENT_TYPE, media_type.to_string())
            .body(Body::Bytes(bytes));
        let response = self
            .send(reference, Self::push_scope(reference), request)
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status("PUT", &url, response).await);
        }
        let digest = match header_str(&response, &docker_content_digest_header()) {
            Some(s) => Digest::parse(&s)?,
            None => computed,
        };
        info!(reference = %reference, %digest, "pushed manifest");
        Ok(Descriptor::new(media_type, &digest, size))
    }

    /// DELETE a manifest by digest.
    pub async fn delete_manifest(&self, reference: &Reference, digest: &Digest) -> Result<()> {
        let url = self.repo_url(reference, &format!("manifests/{digest}"));
        self.delete(reference, url).await
    }

    async fn delete(&self, reference: &Reference, url: String) -> Result<()> {
        let request = OutboundRequest::new(Method::DELETE, &url);
        let response = self
            .send(reference, Self::push_scope(reference), request)
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(OciError::DeleteNotSupported(url)),
            _ => Err(unexpected_status("DELETE", &url, response).await),
        }
    }

    // -- tags ---------------------------------------------------------------

    /// Lazily paginated tag listing.
    pub fn tags<'a>(&'a self, reference: &Reference, page_size: Option<usize>) -> TagPager<'a> {
        TagPager {
            registry: self,
            reference: reference.clone(),
            page_size,
            next_url: None,
            started: false,
            done: false,
        }
    }

    /// All tags of a repository, following pagination to the end.
    pub async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        let mut pager = self.tags(reference, None);
        let mut tags = Vec::new();
        while let Some(page) = pager.next_page().await? {
            tags.extend(page);
        }
        Ok(tags)
    }

    // -- referrers ----------------------------------------------------------

    /// List manifests whose `subject` points at `digest`.  Falls back to
    /// the tag-schema lookup when the referrers endpoint is absent.
    pub async fn referrers(&self, reference: &Reference, digest: &Digest) -> Result<Index> {
        let url = self.repo_url(reference, &format!("referrers/{digest}"));
        let request = OutboundRequest::new(Method::GET, &url).header(ACCEPT, MEDIA_TYPE_OCI_INDEX);
        let response = self
            .send(reference, Self::pull_scope(reference), request)
            .await?;
        match response.status() {
            StatusCode::OK => {
                let bytes = response.bytes().await.map_err(OciError::from)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            StatusCode::NOT_FOUND => {
                debug!(%digest, "referrers API absent, trying tag schema");
                let tag = format!("{}-{}", digest.algorithm(), digest.hex());
                let fallback = Reference::parse(&format!(
                    "{}/{}:{}",
                    reference.registry(),
                    reference.repository(),
                    tag
                ))?;
                match self.pull_manifest(&fallback).await {
                    Ok((ManifestKind::Index(index), _, _)) => Ok(index),
                    Ok(_) => Ok(Index::new(Vec::new())),
                    Err(OciError::NotFound(_)) => Ok(Index::new(Vec::new())),
                    Err(e) => Err(e),
                }
            }
            _ => Err(unexpected_status("GET", &url, response).await),
        }
    }

    // -- artifacts ----------------------------------------------------------

    /// Push files as an artifact: each file becomes a layer blob, the
    /// config defaults to the empty `{}` blob, and the assembled manifest
    /// is PUT under the reference's tag (or its content digest when the
    /// reference is untagged).
    pub async fn push_artifact(
        &self,
        reference: &Reference,
        files: &[PathBuf],
        artifact_type: Option<&str>,
        annotations: Option<BTreeMap<String, String>>,
        config: Option<ArtifactConfig>,
    ) -> Result<(Manifest, Descriptor)> {
        let mut layers = Vec::with_capacity(files.len());
        for path in files {
            let (layer_digest, size) = digest::digest_file(Algorithm::Sha256, path).await?;
            self.push_blob(reference, &layer_digest, Body::File(path.clone()))
                .await?;
            let title = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| layer_digest.hex().to_string());
            layers.push(
                Descriptor::new(MEDIA_TYPE_DEFAULT_LAYER, &layer_digest, size)
                    .with_annotation(ANNOTATION_TITLE, title),
            );
        }

        let config_descriptor = match config {
            Some(config) => {
                let config_digest = digest_bytes(Algorithm::Sha256, &config.bytes);
                let size = config.bytes.len() as u64;
                self.push_blob(reference, &config_digest, Body::Bytes(config.bytes))
                    .await?;
                Descriptor::new(config.media_type, &config_digest, size)
            }
            None => {
                let descriptor = empty_config_descriptor();
                self.push_blob(
                    reference,
                    &descriptor.parsed_digest()?,
                    Body::Bytes(EMPTY_CONFIG_BYTES.to_vec()),
                )
                .await?;
                descriptor
            }
        };

        let mut manifest = Manifest::new(config_descriptor, layers);
        manifest.artifact_type = artifact_type.map(String::from);
        manifest.annotations = annotations;
        let bytes = manifest.to_bytes()?;

        let target = if reference.tag().is_some() {
            reference.clone()
        } else {
            reference.with_digest(digest_bytes(Algorithm::Sha256, &bytes))
        };
        let media_type = manifest.media_type.clone();
        let descriptor = self
            .push_manifest_bytes(&target, &media_type, bytes)
            .await?;
        Ok((manifest, descriptor))
    }

    /// Pull an artifact's layers into `dest`, one file per layer, named by
    /// the layer's title annotation (or its digest hex).
    pub async fn pull_artifact(&self, reference: &Reference, dest: &Path) -> Result<Vec<PathBuf>> {
        let (kind, _, _) = self.pull_manifest(reference).await?;
        let manifest = match kind {
            ManifestKind::Manifest(m) => m,
            ManifestKind::Index(i) => {
                return Err(OciError::InvalidManifestHeaders(format!(
                    "Unsupported content type: {}",
                    i.media_type
                )))
            }
        };

        tokio::fs::create_dir_all(dest).await?;
        let mut written = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let layer_digest = layer.parsed_digest()?;
            let name = layer
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_TITLE))
                .map(String::as_str)
                .unwrap_or_else(|| layer_digest.hex());
            // Annotation values are untrusted; keep only the final path
            // component.
            let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
            let path = dest.join(name);
            let mut file = tokio::fs::File::create(&path).await?;
            self.pull_blob(reference, &layer_digest, &mut file).await?;
            written.push(path);
        }
        Ok(written)
    }
}

/// A caller-supplied artifact config blob.
pub struct ArtifactConfig {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Tag pagination
// ---------------------------------------------------------------------------

/// Lazy page-by-page iteration over `tags/list`, following `Link` headers
/// until the registry stops sending one.
pub struct TagPager<'a> {
    registry: &'a Registry,
    reference: Reference,
    page_size: Option<usize>,
    next_url: Option<String>,
    started: bool,
    done: bool,
}

impl TagPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let url = match self.next_url.take() {
            Some(url) => url,
            None if !self.started => {
                let mut url = self.registry.repo_url(&self.reference, "tags/list");
                if let Some(n) = self.page_size {
                    url.push_str(&format!("?n={n}"));
                }
                url
            }
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        self.started = true;

        let request = OutboundRequest::new(Method::GET, &url);
        let response = self
            .registry
            .send(
                &self.reference,
                Registry::pull_scope(&self.reference),
                request,
            )
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status("GET", &url, response).await);
        }

        self.next_url = next_link(&response);
        if self.next_url.is_none() {
            self.done = true;
        }
        let bytes = response.bytes().await.map_err(OciError::from)?;
        let page: TagList = serde_json::from_slice(&bytes)?;
        Ok(Some(page.tags))
    }
}

/// Parse a `Link: <url>; rel="next"` header, resolving relative targets
/// against the response URL.
fn next_link(response: &Response) -> Option<String> {
    let link = response.headers().get(reqwest::header::LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let part = part.trim();
        if !part.contains(r#"rel="next""#) {
            continue;
        }
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        let target = &part[start..end];
        return response.url().join(target).ok().map(|u| u.to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn unexpected_status(method: &str, url: &str, response: Response) -> OciError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return OciError::NotFound(url.to_string());
    }
    let body = response.text().await.unwrap_or_default();
    OciError::transport_status(
        status.as_u16(),
        format!("{method} {url} returned {status}: {body}"),
    )
}

fn header_str(response: &Response, name: &HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn content_length(response: &Response) -> Option<u64> {
    header_str(response, &CONTENT_LENGTH)?.parse().ok()
}

/// The `Content-Type` value with any parameters (`; charset=...`) stripped.
fn content_type_of(response: &Response) -> Option<String> {
    let value = header_str(response, &CONTENT_TYPE)?;
    Some(value.split(';').next().unwrap_or("").trim().to_string())
}

/// Resolve the `Location` header of an upload response.  Path-relative
/// values resolve against the response's final URL, which accounts for any
/// redirect the request went through.
fn resolve_location(response: &Response) -> Result<Url> {
    let location = header_str(response, &LOCATION).ok_or_else(|| OciError::Transport {
        status: Some(response.status().as_u16()),
        message: format!("{} response without a Location header", response.url()),
    })?;
    response
        .url()
        .join(&location)
        .map_err(|e| OciError::Transport {
            status: None,
            message: format!("unresolvable upload location {location:?}: {e}"),
        })
}

/// Append `digest=<digest>` to an upload URL, preserving any query string
/// the registry put there.
fn append_digest_query(url: &Url, digest: &Digest) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut()
        .append_pair("digest", &digest.to_string());
    url
}

/// Parse the end offset out of a `Range: 0-<end>` header.
fn parse_range_end(range: &str) -> Result<u64> {
    let end = range
        .rsplit('-')
        .next()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| OciError::Transport {
            status: None,
            message: format!("unparsable Range header {range:?}"),
        })?;
    Ok(end)
}

async fn body_size(body: &Body) -> Result<u64> {
    match body {
        Body::Empty => Ok(0),
        Body::Bytes(bytes) => Ok(bytes.len() as u64),
        Body::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_digest_preserves_existing_query() {
        let digest = digest_bytes(Algorithm::Sha256, b"{}");
        let url = Url::parse("http://registry.local/upload/abc?state=xyz").unwrap();
        let out = append_digest_query(&url, &digest);
        assert!(out.query().unwrap().starts_with("state=xyz&digest=sha256"));
    }

    #[test]
    fn parse_range_end_variants() {
        assert_eq!(parse_range_end("0-41").unwrap(), 41);
        assert_eq!(parse_range_end("bytes=0-1023").unwrap(), 1023);
        assert!(parse_range_end("garbage").is_err());
    }

    #[test]
    fn scopes() {
        let r = Reference::parse("localhost:5000/library/x").unwrap();
        assert_eq!(Registry::pull_scope(&r), "repository:library/x:pull");
        assert_eq!(Registry::push_scope(&r), "repository:library/x:pull,push");
    }

    #[tokio::test]
    async fn repo_url_shape() {
        let registry = Registry::builder().insecure(true).build().unwrap();
        let r = Reference::parse("localhost:5000/library/x:latest").unwrap();
        assert_eq!(
            registry.repo_url(&r, "blobs/uploads/"),
            "http://localhost:5000/v2/library/x/blobs/uploads/"
        );
        assert_eq!(
            registry.repo_url(&r, "manifests/latest"),
            "http://localhost:5000/v2/library/x/manifests/latest"
        );
    }

    #[tokio::test]
    async fn context_path_override() {
        let registry = Registry::builder()
            .insecure(true)
            .context_path("/prefix/v2/")
            .build()
            .unwrap();
        let r = Reference::parse("localhost:5000/repo").unwrap();
        assert_eq!(
            registry.repo_url(&r, "tags/list"),
            "http://localhost:5000/prefix/v2/repo/tags/list"
        );
    }
}
