use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A resolved credential for a registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    UsernamePassword(String, String),
    BearerToken(String),
    Anonymous,
}

impl Credential {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

/// Resolves a credential for a registry host.
pub trait CredentialProvider: Send + Sync {
    fn credentials_for(&self, host: &str) -> Credential;
}

// ---------------------------------------------------------------------------
// Static provider
// ---------------------------------------------------------------------------

/// Fixed username/password for every host.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials_for(&self, _host: &str) -> Credential {
        Credential::UsernamePassword(self.username.clone(), self.password.clone())
    }
}

/// A fixed bearer token for every host.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticToken {
    fn credentials_for(&self, _host: &str) -> Credential {
        Credential::BearerToken(self.token.clone())
    }
}

// ---------------------------------------------------------------------------
// Docker config file
// ---------------------------------------------------------------------------

/// Docker-style `config.json` schema; unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// Credentials read from a docker config file at construction time.
/// Later changes to the file on disk are not observed.
pub struct DockerConfigFile {
    auths: HashMap<String, DockerAuthEntry>,
}

impl DockerConfigFile {
    /// Load `path`, failing if the file exists but cannot be parsed.
    /// A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                auths: HashMap::new(),
            });
        }
        let data = std::fs::read_to_string(path)?;
        let config: DockerConfig = serde_json::from_str(&data)?;
        debug!(path = %path.display(), hosts = config.auths.len(), "loaded docker config");
        Ok(Self {
            auths: config.auths,
        })
    }

    /// The default provider chain: `$DOCKER_CONFIG/config.json`, then
    /// `~/.docker/config.json`.
    pub fn default_chain() -> ChainProvider {
        let mut chain = ChainProvider::new();
        for dir in default_config_dirs() {
            if let Ok(store) = Self::load(dir.join("config.json")) {
                chain = chain.push(store);
            }
        }
        chain
    }

    fn lookup(&self, host: &str) -> Option<&DockerAuthEntry> {
        if let Some(entry) = self.auths.get(host) {
            return Some(entry);
        }
        // Docker Hub is addressed under several host names; treat the
        // aliases as one host at lookup.
        let canonical = normalize_hub_host(host);
        self.auths
            .iter()
            .find(|(key, _)| normalize_hub_host(key) == canonical)
            .map(|(_, entry)| entry)
    }
}

impl CredentialProvider for DockerConfigFile {
    fn credentials_for(&self, host: &str) -> Credential {
        let Some(entry) = self.lookup(host) else {
            return Credential::Anonymous;
        };
        if let Some(token) = entry.identitytoken.as_deref() {
            return Credential::BearerToken(token.to_string());
        }
        match entry.auth.as_deref().map(decode_basic_auth) {
            Some(Ok((user, pass))) => Credential::UsernamePassword(user, pass),
            _ => Credential::Anonymous,
        }
    }
}

fn default_config_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        dirs_out.push(PathBuf::from(dir));
    }
    if let Some(home) = dirs::home_dir() {
        dirs_out.push(home.join(".docker"));
    }
    dirs_out
}

fn normalize_hub_host(host: &str) -> &str {
    let host = host.strip_prefix("https://").unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io",
        other => other,
    }
}

/// Decode base64 `user:pass` from a docker config `auth` field.
fn decode_basic_auth(auth: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| OciError::Unauthorized(format!("malformed auth entry: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| OciError::Unauthorized(format!("malformed auth entry: {e}")))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| OciError::Unauthorized("auth entry missing ':'".to_string()))?;
    Ok((user.to_string(), pass.trim_end_matches('\n').to_string()))
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Tries providers in order; the first non-anonymous credential wins.
#[derive(Default)]
pub struct ChainProvider {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }
}

impl CredentialProvider for ChainProvider {
    fn credentials_for(&self, host: &str) -> Credential {
        for provider in &self.providers {
            let cred = provider.credentials_for(host);
            if !cred.is_anonymous() {
                return cred;
            }
        }
        Credential::Anonymous
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // base64("myuser:mypass")
    const MYUSER_AUTH: &str = "bXl1c2VyOm15cGFzcw==";

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn static_credentials_apply_to_any_host() {
        let p = StaticCredentials::new("u", "p");
        assert_eq!(
            p.credentials_for("ghcr.io"),
            Credential::UsernamePassword("u".into(), "p".into())
        );
    }

    #[test]
    fn file_store_basic_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(r#"{{"auths":{{"localhost:5000":{{"auth":"{MYUSER_AUTH}"}}}}}}"#),
        );
        let store = DockerConfigFile::load(path).unwrap();
        assert_eq!(
            store.credentials_for("localhost:5000"),
            Credential::UsernamePassword("myuser".into(), "mypass".into())
        );
    }

    #[test]
    fn file_store_identity_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"{{"auths":{{"ghcr.io":{{"auth":"{MYUSER_AUTH}","identitytoken":"tok-123"}}}}}}"#
            ),
        );
        let store = DockerConfigFile::load(path).unwrap();
        assert_eq!(
            store.credentials_for("ghcr.io"),
            Credential::BearerToken("tok-123".into())
        );
    }

    #[test]
    fn file_store_missing_host_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"auths":{}}"#);
        let store = DockerConfigFile::load(path).unwrap();
        assert_eq!(store.credentials_for("quay.io"), Credential::Anonymous);
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DockerConfigFile::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(store.credentials_for("quay.io"), Credential::Anonymous);
    }

    #[test]
    fn file_store_unknown_keys_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"{{"auths":{{"quay.io":{{"auth":"{MYUSER_AUTH}","email":"x@y.z"}}}},"credsStore":"desktop"}}"#
            ),
        );
        let store = DockerConfigFile::load(path).unwrap();
        assert!(!store.credentials_for("quay.io").is_anonymous());
    }

    #[test]
    fn file_store_hub_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{MYUSER_AUTH}"}}}}}}"#),
        );
        let store = DockerConfigFile::load(path).unwrap();
        assert!(!store.credentials_for("registry-1.docker.io").is_anonymous());
        assert!(!store.credentials_for("docker.io").is_anonymous());
    }

    #[test]
    fn chain_first_non_anonymous_wins() {
        let dir = tempfile::tempdir().unwrap();
        let empty = DockerConfigFile::load(dir.path().join("nope.json")).unwrap();
        let chain = ChainProvider::new()
            .push(empty)
            .push(StaticCredentials::new("u2", "p2"));
        assert_eq!(
            chain.credentials_for("ghcr.io"),
            Credential::UsernamePassword("u2".into(), "p2".into())
        );
    }

    #[test]
    fn empty_chain_is_anonymous() {
        let chain = ChainProvider::new();
        assert_eq!(chain.credentials_for("ghcr.io"), Credential::Anonymous);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_basic_auth("!!!not-base64!!!").is_err());
        // valid base64 but no colon
        let no_colon = base64::engine::general_purpose::STANDARD.encode("userpass");
        assert!(decode_basic_auth(&no_colon).is_err());
    }
}
