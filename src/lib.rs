//! ocidist -- an OCI Distribution client.
//!
//! Pushes and pulls container images and generic artifacts to and from
//! remote registries, and mirrors manifest graphs into the OCI Image
//! Layout directory format on local disk.  The pieces compose around a
//! shared digest engine: every blob that crosses the wire or lands on
//! disk is verified against its descriptor digest.
//!
//! ```no_run
//! use ocidist::{Copier, OciLayout, Reference, Registry};
//!
//! # async fn demo() -> ocidist::Result<()> {
//! let registry = Registry::builder().build()?;
//! let layout = OciLayout::init("/tmp/mirror").await?;
//! let reference = Reference::parse("ghcr.io/org/app:v1")?;
//!
//! Copier::new(&registry, &layout).copy(&reference).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod copy;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod transport;

pub use copy::Copier;
pub use credentials::{ChainProvider, Credential, CredentialProvider, DockerConfigFile, StaticCredentials};
pub use digest::{Algorithm, Digest};
pub use error::{OciError, Result};
pub use layout::OciLayout;
pub use manifest::{Descriptor, Index, Manifest, ManifestKind};
pub use reference::Reference;
pub use registry::{ArtifactConfig, Registry, RegistryBuilder};
pub use transport::Body;
