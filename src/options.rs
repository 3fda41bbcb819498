//! Caller facing configuration of pull and push operations

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{Result, TransferError};
use crate::keychain::CredentialSource;
use crate::reference::ParseOptions;

/// Configuration of a pull or push.
///
/// Every field has a default, so options files only need to name what they change:
///
/// | field             | default | meaning                                              |
/// |-------------------|---------|------------------------------------------------------|
/// | `base`            | `""`    | reference to pull                                    |
/// | `target`          | `""`    | tag reference to push to                             |
/// | `pull-insecure`   | `false` | allow plain HTTP / self-signed certs for `base`      |
/// | `push-insecure`   | `false` | allow plain HTTP / self-signed certs for `target`    |
/// | `push-config-dir` | none    | Docker config directory holding registry credentials |
/// | `jobs`            | none    | bound on parallel blob transfers, `0` means unbounded |
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Options {
    /// Source image reference
    pub base: String,
    /// Destination tag reference
    pub target: String,
    /// Allow insecure access to the source registry
    pub pull_insecure: bool,
    /// Allow insecure access to the destination registry
    pub push_insecure: bool,
    /// Docker config directory to read credentials from, instead of the default one
    pub push_config_dir: Option<PathBuf>,
    /// Maximum number of concurrent blob transfers
    pub jobs: Option<usize>,
}

impl Options {
    /// Options pulling from `base`
    pub fn pull(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            ..Default::default()
        }
    }

    /// Options pushing to `target`
    pub fn push(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Read options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options_error = |source: std::io::Error| TransferError::OptionsFile {
            path: path.to_path_buf(),
            source,
        };
        let content = std::fs::read(path).map_err(options_error)?;
        serde_json::from_slice(&content).map_err(|e| options_error(e.into()))
    }

    /// Set the source reference
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Set the destination reference
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Toggle insecure access to the source registry
    pub fn with_pull_insecure(mut self, insecure: bool) -> Self {
        self.pull_insecure = insecure;
        self
    }

    /// Toggle insecure access to the destination registry
    pub fn with_push_insecure(mut self, insecure: bool) -> Self {
        self.push_insecure = insecure;
        self
    }

    /// Read credentials from the given Docker config directory
    pub fn with_push_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.push_config_dir = Some(dir.into());
        self
    }

    /// Bound parallel blob transfers
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Parse modifiers for the source reference
    pub fn pull_parse_options(&self) -> ParseOptions {
        ParseOptions {
            insecure: self.pull_insecure,
        }
    }

    /// Parse modifiers for the destination reference
    pub fn push_parse_options(&self) -> ParseOptions {
        ParseOptions {
            insecure: self.push_insecure,
        }
    }

    /// Registry client options: credential source and concurrency bound
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            credentials: CredentialSource::from_config_dir(self.push_config_dir.as_deref()),
            max_concurrency: self.jobs.filter(|jobs| *jobs > 0),
        }
    }
}

/// Options handed to the registry client for a single read or write
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Where registry credentials come from
    pub credentials: CredentialSource,
    /// Bound on parallel blob transfers; `None` leaves the client default in place
    pub max_concurrency: Option<usize>,
}
