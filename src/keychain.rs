//! Resolution of registry credentials

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use base64::Engine as _;
use docker_credential::{CredentialRetrievalError, DockerCredential};
use oci_client::secrets::RegistryAuth;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{Result, TransferError};

/// Name of the Docker config file inside a config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Legacy key some tools use for Docker Hub credentials
const DOCKER_HUB_LEGACY_KEY: &str = "https://index.docker.io/v1/";

/// User name paired with identity (refresh) tokens
const IDENTITY_TOKEN_USERNAME: &str = "<token>";

/// What credential helpers print when they hold nothing for a registry
const CREDENTIALS_NOT_FOUND: &str = "credentials not found";

/// Something able to find credentials for a registry host
pub trait Keychain: Send + Sync {
    /// Resolve the credentials to use for `registry`. Hosts without credentials resolve to
    /// [`RegistryAuth::Anonymous`].
    fn resolve(&self, registry: &str) -> Result<RegistryAuth>;
}

/// Where credentials for a transfer come from
#[derive(Clone, Default)]
pub enum CredentialSource {
    /// The process-wide Docker configuration, see [`DefaultKeychain`]
    #[default]
    Default,
    /// A Docker config directory at the given path, see [`DirKeychain`]
    Directory(PathBuf),
    /// Any other credential provider
    Custom(Arc<dyn Keychain>),
}

impl CredentialSource {
    /// Pick the directory keychain when a non-empty directory is configured, the default one
    /// otherwise
    pub fn from_config_dir(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) if !dir.as_os_str().is_empty() => CredentialSource::Directory(dir.into()),
            _ => CredentialSource::Default,
        }
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Default => f.write_str("Default"),
            CredentialSource::Directory(dir) => f.debug_tuple("Directory").field(dir).finish(),
            CredentialSource::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Keychain for CredentialSource {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        match self {
            CredentialSource::Default => DefaultKeychain.resolve(registry),
            CredentialSource::Directory(dir) => DirKeychain::new(dir).resolve(registry),
            CredentialSource::Custom(keychain) => keychain.resolve(registry),
        }
    }
}

/// Credentials discovered through `$DOCKER_CONFIG` or `~/.docker/config.json`, including
/// credential helpers configured there
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeychain;

impl DefaultKeychain {
    /// Location of the default Docker config file, if a home or config directory is known
    pub fn config_path() -> Option<PathBuf> {
        std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".docker")))
            .map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

impl Keychain for DefaultKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        let Some(path) = Self::config_path() else {
            debug!(%registry, "No docker config location, using anonymous access");
            return Ok(RegistryAuth::Anonymous);
        };
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%registry, path = %path.display(), "No docker config, anonymous access");
                return Ok(RegistryAuth::Anonymous);
            }
            Err(source) => return Err(TransferError::CredentialConfig { path, source }),
        };

        let config = content.as_slice();
        let found = match docker_credential::get_credential_from_reader(config, registry) {
            Err(e) if registry == "index.docker.io" && no_entry(&e) => {
                docker_credential::get_credential_from_reader(config, DOCKER_HUB_LEGACY_KEY)
            }
            other => other,
        };
        match found {
            Ok(DockerCredential::UsernamePassword(username, password)) => {
                debug!(%registry, "Found docker credentials");
                Ok(RegistryAuth::Basic(username, password))
            }
            Ok(DockerCredential::IdentityToken(token)) => {
                debug!(%registry, "Found docker identity token");
                Ok(RegistryAuth::Basic(
                    IDENTITY_TOKEN_USERNAME.to_string(),
                    token,
                ))
            }
            Err(CredentialRetrievalError::NoCredentialConfigured) => {
                debug!(%registry, "No docker credentials, using anonymous access");
                Ok(RegistryAuth::Anonymous)
            }
            Err(e) if no_entry(&e) => {
                warn!(%registry, "Credential helper has no entry, using anonymous access");
                Ok(RegistryAuth::Anonymous)
            }
            Err(e) => Err(TransferError::Credentials {
                registry: registry.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Whether a lookup failed only because nothing is stored for the registry
fn no_entry(error: &CredentialRetrievalError) -> bool {
    match error {
        CredentialRetrievalError::NoCredentialConfigured => true,
        CredentialRetrievalError::HelperFailure { stdout, .. } => {
            stdout.contains(CREDENTIALS_NOT_FOUND)
        }
        _ => false,
    }
}

/// Credentials read from a Docker config directory other than the default one
#[derive(Debug, Clone)]
pub struct DirKeychain {
    dir: PathBuf,
}

impl DirKeychain {
    /// Keychain rooted at `dir`; credentials are read from `dir/config.json` on each lookup
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The config directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_config(&self) -> Result<Option<DockerConfig>> {
        let path = self.dir.join(CONFIG_FILE_NAME);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Docker config not found");
                return Ok(None);
            }
            Err(source) => return Err(TransferError::CredentialConfig { path, source }),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| TransferError::CredentialConfig {
                path,
                source: e.into(),
            })
    }
}

impl Keychain for DirKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        let Some(config) = self.load_config()? else {
            return Ok(RegistryAuth::Anonymous);
        };

        let mut entry = config.auths.get(registry);
        if entry.is_none() && registry == "index.docker.io" {
            entry = config.auths.get(DOCKER_HUB_LEGACY_KEY);
        }
        if let Some(auth) = entry.and_then(|entry| entry.to_auth(registry).transpose()) {
            debug!(%registry, dir = %self.dir.display(), "Found credentials in config dir");
            return auth;
        }

        let helper = config
            .cred_helpers
            .get(registry)
            .or(config.creds_store.as_ref());
        if let Some(helper) = helper {
            return run_credential_helper(helper, registry);
        }

        debug!(%registry, dir = %self.dir.display(), "No credentials in config dir, using anonymous access");
        Ok(RegistryAuth::Anonymous)
    }
}

/// Execute `docker-credential-<helper> get`, passing the registry on stdin and parsing its stdout
/// as JSON
fn run_credential_helper(helper: &str, registry: &str) -> Result<RegistryAuth> {
    use std::io::Write;

    let program = format!("docker-credential-{}", helper);
    let fail = |reason: String| TransferError::Credentials {
        registry: registry.to_string(),
        reason,
    };

    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| fail(format!("running {}: {}", program, e)))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(registry.as_bytes())
            .map_err(|e| fail(format!("writing to {}: {}", program, e)))?;
    }
    let output = child
        .wait_with_output()
        .map_err(|e| fail(format!("waiting for {}: {}", program, e)))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        // helpers report a missing entry this way rather than through the exit code alone
        if stdout.contains(CREDENTIALS_NOT_FOUND) {
            warn!(%registry, %program, "Credential helper has no entry, using anonymous access");
            return Ok(RegistryAuth::Anonymous);
        }
        return Err(fail(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let response: CredHelperResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| fail(format!("decoding {} output: {}", program, e)))?;
    Ok(RegistryAuth::Basic(response.username, response.secret))
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct DockerConfig {
    auths: HashMap<String, AuthConfig>,
    #[serde(rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct AuthConfig {
    auth: String, // base64-encoded username:password
    username: String,
    password: String,
    #[serde(rename = "identitytoken")]
    identity_token: String,
}

impl AuthConfig {
    fn to_auth(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        if !self.auth.is_empty() {
            let invalid = |reason: String| TransferError::Credentials {
                registry: registry.to_string(),
                reason,
            };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(self.auth.trim())
                .map_err(|e| invalid(format!("decoding auth field: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| invalid(format!("decoding auth field: {}", e)))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| invalid("auth field is not username:password".to_string()))?;
            return Ok(Some(RegistryAuth::Basic(
                username.to_string(),
                password.to_string(),
            )));
        }
        if !self.username.is_empty() && !self.password.is_empty() {
            return Ok(Some(RegistryAuth::Basic(
                self.username.clone(),
                self.password.clone(),
            )));
        }
        if !self.identity_token.is_empty() {
            return Ok(Some(RegistryAuth::Basic(
                IDENTITY_TOKEN_USERNAME.to_string(),
                self.identity_token.clone(),
            )));
        }
        Ok(None)
    }
}

#[derive(Deserialize, Debug)]
struct CredHelperResponse {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn basic(auth: RegistryAuth) -> Option<(String, String)> {
        match auth {
            RegistryAuth::Basic(username, password) => Some((username, password)),
            _ => None,
        }
    }

    fn write_config(content: &str) -> TempDir {
        let dir = TempDir::new().expect("cannot create tmp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), content).expect("cannot write config");
        dir
    }

    #[test]
    fn dir_keychain_decodes_auth_field() {
        // "testuser:testpassword"
        let dir = write_config(
            r#"{"auths": {"registry.example.com": {"auth": "dGVzdHVzZXI6dGVzdHBhc3N3b3Jk"}}}"#,
        );
        let auth = DirKeychain::new(dir.path())
            .resolve("registry.example.com")
            .expect("credentials");
        assert_eq!(
            basic(auth),
            Some(("testuser".to_string(), "testpassword".to_string()))
        );
    }

    #[test]
    fn dir_keychain_username_password_and_identity_token() {
        let dir = write_config(
            r#"{"auths": {
                "a.example.com": {"username": "alice", "password": "secret"},
                "b.example.com": {"identitytoken": "refresh"}
            }}"#,
        );
        let keychain = DirKeychain::new(dir.path());
        assert_eq!(
            basic(keychain.resolve("a.example.com").expect("credentials")),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert_eq!(
            basic(keychain.resolve("b.example.com").expect("credentials")),
            Some(("<token>".to_string(), "refresh".to_string()))
        );
    }

    #[test]
    fn dir_keychain_docker_hub_legacy_key() {
        let dir = write_config(
            r#"{"auths": {"https://index.docker.io/v1/": {"username": "hub", "password": "pw"}}}"#,
        );
        let auth = DirKeychain::new(dir.path())
            .resolve("index.docker.io")
            .expect("credentials");
        assert_eq!(basic(auth), Some(("hub".to_string(), "pw".to_string())));
    }

    #[test]
    fn dir_keychain_falls_back_to_anonymous() {
        let empty = TempDir::new().expect("cannot create tmp dir");
        assert!(matches!(
            DirKeychain::new(empty.path())
                .resolve("registry.example.com")
                .expect("anonymous"),
            RegistryAuth::Anonymous
        ));

        let dir = write_config(r#"{"auths": {"other.example.com": {"auth": ""}}}"#);
        assert!(matches!(
            DirKeychain::new(dir.path())
                .resolve("registry.example.com")
                .expect("anonymous"),
            RegistryAuth::Anonymous
        ));
    }

    #[test]
    fn dir_keychain_rejects_broken_config() {
        let dir = write_config("{ not json");
        let err = DirKeychain::new(dir.path())
            .resolve("registry.example.com")
            .expect_err("config is not valid json");
        assert!(matches!(err, TransferError::CredentialConfig { .. }));

        let dir = write_config(r#"{"auths": {"registry.example.com": {"auth": "%%%"}}}"#);
        let err = DirKeychain::new(dir.path())
            .resolve("registry.example.com")
            .expect_err("auth is not base64");
        assert!(matches!(err, TransferError::Credentials { .. }));
    }

    #[test]
    fn credential_source_selection() {
        assert!(matches!(
            CredentialSource::from_config_dir(None),
            CredentialSource::Default
        ));
        assert!(matches!(
            CredentialSource::from_config_dir(Some(Path::new(""))),
            CredentialSource::Default
        ));
        match CredentialSource::from_config_dir(Some(Path::new("/etc/registry"))) {
            CredentialSource::Directory(dir) => assert_eq!(dir, Path::new("/etc/registry")),
            other => panic!("unexpected source: {:?}", other),
        }
    }

    #[test]
    fn custom_source_delegates() {
        struct Fixed;
        impl Keychain for Fixed {
            fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
                Ok(RegistryAuth::Basic(registry.to_string(), "pw".to_string()))
            }
        }

        let source = CredentialSource::Custom(Arc::new(Fixed));
        assert_eq!(
            basic(source.resolve("registry.example.com").expect("credentials")),
            Some(("registry.example.com".to_string(), "pw".to_string()))
        );
    }

    #[cfg(unix)]
    fn write_helper(dir: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(format!("docker-credential-{}", name));
        std::fs::write(&path, script).expect("cannot write helper");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("cannot make helper executable");
    }

    // The only test touching DOCKER_CONFIG and PATH
    #[cfg(unix)]
    #[test]
    fn helpers_without_an_entry_resolve_to_anonymous() {
        let bin = TempDir::new().expect("cannot create tmp dir");
        write_helper(
            bin.path(),
            "empty",
            "#!/bin/sh\necho 'credentials not found in native keychain'\nexit 1\n",
        );
        write_helper(
            bin.path(),
            "fixed",
            "#!/bin/sh\nregistry=$(cat)\nprintf '{\"Username\":\"helper\",\"Secret\":\"%s\"}' \"$registry\"\n",
        );
        write_helper(
            bin.path(),
            "broken",
            "#!/bin/sh\necho 'keychain locked' >&2\nexit 1\n",
        );
        let config = write_config(
            r#"{
                "credsStore": "empty",
                "credHelpers": {
                    "helped.example.com": "fixed",
                    "broken.example.com": "broken"
                }
            }"#,
        );
        let no_config = TempDir::new().expect("cannot create tmp dir");

        let saved_path = std::env::var_os("PATH").unwrap_or_default();
        let saved_config = std::env::var_os("DOCKER_CONFIG");
        let mut dirs = vec![bin.path().to_path_buf()];
        dirs.extend(std::env::split_paths(&saved_path));
        std::env::set_var("PATH", std::env::join_paths(dirs).expect("valid PATH"));
        std::env::set_var("DOCKER_CONFIG", config.path());

        let default_store = DefaultKeychain.resolve("ghcr.io");
        let default_helper = DefaultKeychain.resolve("helped.example.com");
        let default_broken = DefaultKeychain.resolve("broken.example.com");
        let dir_store = DirKeychain::new(config.path()).resolve("ghcr.io");
        let dir_helper = DirKeychain::new(config.path()).resolve("helped.example.com");
        std::env::set_var("DOCKER_CONFIG", no_config.path());
        let missing_config = DefaultKeychain.resolve("ghcr.io");

        std::env::set_var("PATH", saved_path);
        match saved_config {
            Some(dir) => std::env::set_var("DOCKER_CONFIG", dir),
            None => std::env::remove_var("DOCKER_CONFIG"),
        }

        let helped = Some(("helper".to_string(), "helped.example.com".to_string()));
        assert!(matches!(default_store, Ok(RegistryAuth::Anonymous)));
        assert_eq!(basic(default_helper.expect("credentials")), helped);
        match default_broken {
            Err(TransferError::Credentials { registry, reason }) => {
                assert_eq!(registry, "broken.example.com");
                assert!(!reason.contains("HelperFailure"), "{}", reason);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(dir_store, Ok(RegistryAuth::Anonymous)));
        assert_eq!(basic(dir_helper.expect("credentials")), helped);
        assert!(matches!(missing_config, Ok(RegistryAuth::Anonymous)));
    }
}
