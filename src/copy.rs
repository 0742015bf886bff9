use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::error::{OciError, Result};
use crate::layout::OciLayout;
use crate::manifest::{Descriptor, ManifestKind};
use crate::reference::Reference;
use crate::registry::Registry;
use crate::transport::Body;

// ---------------------------------------------------------------------------
// Copier
// ---------------------------------------------------------------------------

/// Moves manifest graphs between a registry and an on-disk layout.
///
/// Fail-fast: the first error aborts the walk.  Blob writes are idempotent,
/// so an interrupted copy resumes where it left off on the next run.
pub struct Copier<'a> {
    registry: &'a Registry,
    layout: &'a OciLayout,
}

impl<'a> Copier<'a> {
    pub fn new(registry: &'a Registry, layout: &'a OciLayout) -> Self {
        Self { registry, layout }
    }

    /// Mirror the manifest graph at `reference` into the layout and record
    /// the top-level descriptor in `index.json` under the reference's tag.
    ///
    /// Re-running a completed copy touches the registry with HEAD requests
    /// only: blobs already on disk are never re-downloaded.
    pub async fn copy(&self, reference: &Reference) -> Result<Descriptor> {
        let (_, descriptor) = self.registry.head_manifest(reference).await?;
        info!(%reference, digest = %descriptor.digest, "copying into layout");
        self.copy_node(reference, &descriptor).await?;
        self.layout
            .add_manifest_to_index(&descriptor, reference.tag())
            .await?;
        Ok(descriptor)
    }

    fn copy_node<'r>(
        &'r self,
        reference: &'r Reference,
        descriptor: &'r Descriptor,
    ) -> BoxFuture<'r, Result<()>> {
        Box::pin(async move {
            let digest = descriptor.parsed_digest()?;
            let bytes = if self.layout.has_blob(&digest).await {
                debug!(%digest, "manifest already in layout");
                self.layout.read_blob(&digest).await?
            } else {
                let by_digest = reference.with_digest(digest.clone());
                let (_, _, bytes) = self.registry.pull_manifest(&by_digest).await?;
                self.layout.put_blob_bytes(&digest, &bytes).await?;
                bytes
            };

            match ManifestKind::from_bytes(Some(&descriptor.media_type), &bytes)? {
                ManifestKind::Index(index) => {
                    for child in &index.manifests {
                        self.copy_node(reference, child).await?;
                    }
                }
                ManifestKind::Manifest(manifest) => {
                    self.copy_blob(reference, &manifest.config).await?;
                    for layer in &manifest.layers {
                        self.copy_blob(reference, layer).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// HEAD-then-GET one blob into the layout, skipping blobs already on
    /// disk.
    async fn copy_blob(&self, reference: &Reference, descriptor: &Descriptor) -> Result<()> {
        let digest = descriptor.parsed_digest()?;
        if self.layout.has_blob(&digest).await {
            debug!(%digest, "blob already in layout");
            return Ok(());
        }
        if self.registry.blob_exists(reference, &digest).await?.is_none() {
            return Err(OciError::NotFound(format!(
                "blob {digest} missing from {reference}"
            )));
        }
        let reader = self.registry.blob_reader(reference, &digest).await?;
        self.layout.put_blob(&digest, reader).await?;
        Ok(())
    }

    /// Push the graph rooted at `reference` (resolved through the layout's
    /// `index.json`) to the registry.  Children are fully uploaded before
    /// the manifest that references them.
    pub async fn push(&self, reference: &Reference) -> Result<Descriptor> {
        let local = self.layout.resolve_ref(&reference.resolvable()).await?;
        info!(%reference, digest = %local.digest, "pushing from layout");
        self.push_node(reference, &local, reference.tag()).await
    }

    fn push_node<'r>(
        &'r self,
        reference: &'r Reference,
        descriptor: &'r Descriptor,
        tag: Option<&'r str>,
    ) -> BoxFuture<'r, Result<Descriptor>> {
        Box::pin(async move {
            let digest = descriptor.parsed_digest()?;
            let bytes = self.layout.read_blob(&digest).await?;

            match ManifestKind::from_bytes(Some(&descriptor.media_type), &bytes)? {
                ManifestKind::Index(index) => {
                    for child in &index.manifests {
                        self.push_node(reference, child, None).await?;
                    }
                }
                ManifestKind::Manifest(manifest) => {
                    self.push_blob_from_layout(reference, &manifest.config).await?;
                    for layer in &manifest.layers {
                        self.push_blob_from_layout(reference, layer).await?;
                    }
                }
            }

            let target = match tag {
                Some(tag) => Reference::parse(&format!(
                    "{}/{}:{}",
                    reference.registry(),
                    reference.repository(),
                    tag
                ))?,
                None => reference.with_digest(digest),
            };
            self.registry
                .push_manifest_bytes(&target, &descriptor.media_type, bytes)
                .await
        })
    }

    async fn push_blob_from_layout(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<()> {
        let digest = descriptor.parsed_digest()?;
        if !self.layout.has_blob(&digest).await {
            return Err(OciError::NotFound(format!(
                "blob {digest} missing from layout {}",
                self.layout.root().display()
            )));
        }
        self.registry
            .push_blob(reference, &digest, Body::File(self.layout.blob_path(&digest)))
            .await?;
        Ok(())
    }
}
