use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::{digest_bytes, Algorithm, Digest};
use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";
pub const MEDIA_TYPE_DEFAULT_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Annotation carrying the original tag of an entry in a layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation carrying the file name of an artifact layer.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// The two-byte body of the empty config blob.
pub const EMPTY_CONFIG_BYTES: &[u8] = b"{}";

const EMPTY_CONFIG_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// The `Accept` value sent on manifest requests: every manifest and index
/// media type the client understands.
pub fn manifest_accept_header() -> String {
    [
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST,
    ]
    .join(", ")
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in manifests, indexes, and the
/// layout `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(
        rename = "artifactType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: &Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.to_string(),
            size,
            annotations: None,
            artifact_type: None,
            urls: None,
            platform: None,
        }
    }

    /// Describe `bytes` under `media_type` using the default algorithm.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        let digest = digest_bytes(Algorithm::Sha256, bytes);
        Self::new(media_type, &digest, bytes.len() as u64)
    }

    /// The parsed digest of this descriptor.
    pub fn parsed_digest(&self) -> Result<Digest> {
        Digest::parse(&self.digest)
    }

    /// The `ref.name` annotation, if present.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// The descriptor of the well-known empty (`{}`) config blob.
pub fn empty_config_descriptor() -> Descriptor {
    Descriptor {
        media_type: MEDIA_TYPE_EMPTY_CONFIG.to_string(),
        digest: EMPTY_CONFIG_DIGEST.to_string(),
        size: EMPTY_CONFIG_BYTES.len() as u64,
        annotations: None,
        artifact_type: None,
        urls: None,
        platform: None,
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// An OCI image or artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    #[serde(
        rename = "artifactType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// A schema-2 OCI manifest with the given config and layers.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            artifact_type: None,
            config,
            layers,
            subject: None,
            annotations: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// An OCI image index (manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Index {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests,
            annotations: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ---------------------------------------------------------------------------
// ManifestKind
// ---------------------------------------------------------------------------

/// A fetched manifest document: a single manifest or an index.
///
/// Discrimination is by wire `Content-Type` first, then by the `mediaType`
/// field (or a `manifests` array) inside the JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    Manifest(Manifest),
    Index(Index),
}

impl ManifestKind {
    pub fn from_bytes(content_type: Option<&str>, bytes: &[u8]) -> Result<Self> {
        if let Some(ct) = content_type {
            if is_index_media_type(ct) {
                return Ok(ManifestKind::Index(serde_json::from_slice(bytes)?));
            }
            if is_manifest_media_type(ct) {
                return Ok(ManifestKind::Manifest(serde_json::from_slice(bytes)?));
            }
        }
        // No usable Content-Type: peek at the document itself.
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
        if is_index_media_type(media_type) || raw.get("manifests").is_some() {
            Ok(ManifestKind::Index(serde_json::from_value(raw)?))
        } else if is_manifest_media_type(media_type) || raw.get("config").is_some() {
            Ok(ManifestKind::Manifest(serde_json::from_value(raw)?))
        } else {
            Err(OciError::InvalidManifestHeaders(format!(
                "Unsupported content type: {media_type}"
            )))
        }
    }

    /// The declared media type of the document.
    pub fn media_type(&self) -> &str {
        match self {
            ManifestKind::Manifest(m) => &m.media_type,
            ManifestKind::Index(i) => &i.media_type,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ManifestKind::Manifest(m) => m.to_bytes(),
            ManifestKind::Index(i) => i.to_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tag list
// ---------------------------------------------------------------------------

/// One page of the `<name>/tags/list` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "artifactType": "application/vnd.example.thing",
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
            "size": 2
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
                "size": 6,
                "annotations": { "org.opencontainers.image.title": "hello.txt" }
            }
        ],
        "annotations": { "note": "sample" }
    }"#;

    const SAMPLE_INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
                "size": 100,
                "platform": { "architecture": "amd64", "os": "linux" }
            }
        ]
    }"#;

    #[test]
    fn parse_manifest() {
        let m: Manifest = serde_json::from_str(SAMPLE_MANIFEST).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.artifact_type.as_deref(), Some("application/vnd.example.thing"));
        assert_eq!(m.config.media_type, MEDIA_TYPE_EMPTY_CONFIG);
        assert_eq!(m.layers.len(), 1);
        assert_eq!(
            m.layers[0]
                .annotations
                .as_ref()
                .unwrap()
                .get(ANNOTATION_TITLE)
                .unwrap(),
            "hello.txt"
        );
    }

    #[test]
    fn manifest_serialization_omits_absent_fields() {
        let m = Manifest::new(empty_config_descriptor(), vec![]);
        let json = String::from_utf8(m.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("subject"));
        assert!(!json.contains("artifactType"));
        assert!(!json.contains("annotations"));
    }

    #[test]
    fn discriminate_by_content_type() {
        let k = ManifestKind::from_bytes(
            Some(MEDIA_TYPE_OCI_INDEX),
            SAMPLE_INDEX.as_bytes(),
        )
        .unwrap();
        assert!(matches!(k, ManifestKind::Index(_)));

        let k = ManifestKind::from_bytes(
            Some(MEDIA_TYPE_OCI_MANIFEST),
            SAMPLE_MANIFEST.as_bytes(),
        )
        .unwrap();
        assert!(matches!(k, ManifestKind::Manifest(_)));
    }

    #[test]
    fn discriminate_by_embedded_media_type() {
        let k = ManifestKind::from_bytes(None, SAMPLE_INDEX.as_bytes()).unwrap();
        assert!(matches!(k, ManifestKind::Index(_)));

        let k = ManifestKind::from_bytes(None, SAMPLE_MANIFEST.as_bytes()).unwrap();
        assert!(matches!(k, ManifestKind::Manifest(_)));
    }

    #[test]
    fn empty_config_descriptor_is_well_known() {
        let d = empty_config_descriptor();
        assert_eq!(d.size, 2);
        assert_eq!(d, Descriptor::from_bytes(MEDIA_TYPE_EMPTY_CONFIG, b"{}"));
    }

    #[test]
    fn ref_name_annotation_round_trip() {
        let d = Descriptor::from_bytes(MEDIA_TYPE_OCI_MANIFEST, b"{}")
            .with_annotation(ANNOTATION_REF_NAME, "v1");
        assert_eq!(d.ref_name(), Some("v1"));
    }

    #[test]
    fn accept_header_lists_all_types() {
        let accept = manifest_accept_header();
        for mt in [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ] {
            assert!(accept.contains(mt));
        }
    }

    #[test]
    fn tag_list_parses() {
        let t: TagList =
            serde_json::from_str(r#"{"name":"library/x","tags":["latest","0.1.1"]}"#).unwrap();
        assert_eq!(t.name, "library/x");
        assert_eq!(t.tags, vec!["latest", "0.1.1"]);
    }
}
