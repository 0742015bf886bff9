use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{OciError, Result};

/// Registry host used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag used when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A parsed registry reference: `[host[:port]/]repo[:tag][@digest]`.
///
/// When both a tag and a digest are present the digest wins for resolution;
/// the tag is kept for display and for `ref.name` annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parse a raw reference string.
    ///
    /// The substring before the first `/` is a host iff it contains `.`,
    /// `:`, or equals `localhost`; otherwise the whole string is a
    /// repository under [`DEFAULT_REGISTRY`].
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::InvalidReference("empty reference".to_string()));
        }

        // Split off the digest first: everything after '@'.
        let (rest, digest) = match raw.split_once('@') {
            Some((rest, digest_part)) => {
                let digest = Digest::parse(digest_part)?;
                (rest, Some(digest))
            }
            None => (raw, None),
        };

        // A tag colon always comes after the last '/'.
        let after_last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match rest.rfind(':') {
            Some(pos) if pos >= after_last_slash => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };

        let (registry, repository) = match name_part.find('/') {
            Some(slash) => {
                let first = &name_part[..slash];
                if first.contains('.') || first.contains(':') || first == "localhost" {
                    (first.to_string(), name_part[slash + 1..].to_string())
                } else {
                    (DEFAULT_REGISTRY.to_string(), name_part.to_string())
                }
            }
            None => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        if repository.is_empty() {
            return Err(OciError::InvalidReference(format!(
                "missing repository in {raw:?}"
            )));
        }
        if !is_valid_repository(&repository) {
            return Err(OciError::InvalidReference(format!(
                "invalid repository {repository:?}"
            )));
        }
        if let Some(ref t) = tag {
            if !is_valid_tag(t) {
                return Err(OciError::InvalidReference(format!("invalid tag {t:?}")));
            }
        }

        // Neither tag nor digest: address the default tag.
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// A host-only reference, used for the `/v2/` ping and login.
    pub fn for_registry(host: impl Into<String>) -> Self {
        Self {
            registry: host.into(),
            repository: String::new(),
            tag: None,
            digest: None,
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The string used to address the manifest: the digest when present,
    /// otherwise the tag.
    pub fn resolvable(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// A copy of this reference addressing `digest` instead of any tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.registry)?;
        if !self.repository.is_empty() {
            write!(f, "/{}", self.repository)?;
        }
        if let Some(ref t) = self.tag {
            write!(f, ":{t}")?;
        }
        if let Some(ref d) = self.digest {
            write!(f, "@{d}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Repository path: `[a-z0-9]+([._-][a-z0-9]+)*` segments separated by `/`.
fn is_valid_repository(repo: &str) -> bool {
    repo.split('/').all(is_valid_repository_segment)
}

fn is_valid_repository_segment(seg: &str) -> bool {
    if seg.is_empty() {
        return false;
    }
    let mut prev_sep = true;
    for c in seg.chars() {
        match c {
            'a'..='z' | '0'..='9' => prev_sep = false,
            '.' | '_' | '-' if !prev_sep => prev_sep = true,
            _ => return false,
        }
    }
    !prev_sep
}

/// Tag: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    if tag.len() > 128 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_repo() {
        let r = Reference::parse("ubuntu").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "ubuntu");
        assert_eq!(r.tag(), Some("latest"));
        assert!(r.digest().is_none());
    }

    #[test]
    fn parse_repo_with_tag() {
        let r = Reference::parse("library/alpine:3.20").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), Some("3.20"));
    }

    #[test]
    fn parse_host_with_port() {
        let r = Reference::parse("localhost:5000/library/x").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "library/x");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn parse_bare_localhost_host() {
        let r = Reference::parse("localhost/repo:v1").unwrap();
        assert_eq!(r.registry(), "localhost");
        assert_eq!(r.repository(), "repo");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn parse_dotted_host() {
        let r = Reference::parse("ghcr.io/foo/bar:v1").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "foo/bar");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn first_segment_without_dot_is_repo() {
        let r = Reference::parse("myuser/myrepo:v2").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "myuser/myrepo");
    }

    #[test]
    fn parse_digest_reference() {
        let digest = "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";
        let r = Reference::parse(&format!("quay.io/org/repo@{digest}")).unwrap();
        assert_eq!(r.registry(), "quay.io");
        assert_eq!(r.repository(), "org/repo");
        assert!(r.tag().is_none());
        assert_eq!(r.digest().unwrap().to_string(), digest);
        assert_eq!(r.resolvable(), digest);
    }

    #[test]
    fn digest_wins_over_tag() {
        let digest = "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";
        let r = Reference::parse(&format!("quay.io/org/repo:v1@{digest}")).unwrap();
        assert_eq!(r.tag(), Some("v1"));
        assert_eq!(r.resolvable(), digest);
    }

    #[test]
    fn display_round_trips() {
        for raw in [
            "localhost:5000/library/x:latest",
            "ghcr.io/foo/bar:v1",
            "quay.io/org/repo@sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
        ] {
            let r = Reference::parse(raw).unwrap();
            assert_eq!(Reference::parse(&r.to_string()).unwrap(), r);
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            Reference::parse(""),
            Err(OciError::InvalidReference(_))
        ));
    }

    #[test]
    fn rejects_uppercase_repository() {
        assert!(matches!(
            Reference::parse("ghcr.io/Foo/bar"),
            Err(OciError::InvalidReference(_))
        ));
    }

    #[test]
    fn rejects_bad_tag() {
        assert!(matches!(
            Reference::parse("ghcr.io/foo/bar:-bad"),
            Err(OciError::InvalidReference(_))
        ));
        let long_tag = "t".repeat(129);
        assert!(Reference::parse(&format!("ghcr.io/foo/bar:{long_tag}")).is_err());
    }

    #[test]
    fn rejects_malformed_digest() {
        assert!(Reference::parse("ghcr.io/foo/bar@sha256:xyz").is_err());
    }

    #[test]
    fn for_registry_is_host_only() {
        let r = Reference::for_registry("localhost:5000");
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "");
        assert!(r.tag().is_none());
    }
}
