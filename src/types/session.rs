//! Immutable launch parameters for a sandbox.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::validate::{Validate, ValidationResult};

use super::GitUser;

/// URL schemes accepted for repository references.
const ALLOWED_SCHEMES: &[&str] = &["https", "http", "ssh", "git", "file"];

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_sync_git() -> bool {
    true
}

/// Compute resources requested for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores, 1.0 = one core.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u32,
}

fn default_cpu_cores() -> f32 {
    1.0
}

fn default_memory_mb() -> u32 {
    1024
}

fn default_disk_mb() -> u32 {
    2048
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            memory_mb: default_memory_mb(),
            disk_mb: default_disk_mb(),
        }
    }
}

impl Validate for ResourceLimits {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !(self.cpu_cores.is_finite() && self.cpu_cores > 0.0) {
            result.add_error(format!("cpu_cores must be positive, got {}", self.cpu_cores));
        }
        if self.memory_mb == 0 {
            result.add_error("memory_mb must be positive");
        }
        if self.disk_mb == 0 {
            result.add_error("disk_mb must be positive");
        }
        if self.cpu_cores > 64.0 {
            result.add_warning(format!("cpu_cores {} is unusually high", self.cpu_cores));
        }

        result
    }
}

/// Serialized form of a [`SessionConfig`]; validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionConfigSpec {
    repo_url: String,
    #[serde(default = "default_git_ref")]
    git_ref: String,
    #[serde(default)]
    limits: ResourceLimits,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    owner: Option<GitUser>,
    #[serde(default = "default_sync_git")]
    sync_git: bool,
}

/// Immutable, validated launch request for one sandbox.
///
/// Built through [`SessionConfig::builder`] or deserialized; both paths
/// reject invalid input with [`Error::InvalidConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SessionConfigSpec", into = "SessionConfigSpec")]
pub struct SessionConfig {
    repo_url: String,
    git_ref: String,
    limits: ResourceLimits,
    env: BTreeMap<String, String>,
    owner: Option<GitUser>,
    sync_git: bool,
}

impl SessionConfig {
    /// Starts building a config for `repo_url`.
    pub fn builder(repo_url: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            repo_url: repo_url.into(),
            git_ref: default_git_ref(),
            limits: ResourceLimits::default(),
            env: Vec::new(),
            owner: None,
            sync_git: default_sync_git(),
        }
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn owner(&self) -> Option<&GitUser> {
        self.owner.as_ref()
    }

    /// Whether the working tree should be cloned once the sandbox runs.
    pub fn sync_git(&self) -> bool {
        self.sync_git
    }

    /// Key identifying logically identical provisioning requests.
    pub fn provision_key(&self) -> ProvisionKey {
        ProvisionKey {
            repo_url: self.repo_url.clone(),
            git_ref: self.git_ref.clone(),
            owner: self
                .owner
                .as_ref()
                .map(|o| o.email.clone())
                .unwrap_or_default(),
        }
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        validate_repo_url(&self.repo_url, &mut result);
        validate_git_ref(&self.git_ref, &mut result);
        result.merge(self.limits.validate());

        for key in self.env.keys() {
            validate_env_key(key, &mut result);
        }

        if let Some(owner) = &self.owner {
            result.merge(owner.validate());
        }

        result
    }
}

impl TryFrom<SessionConfigSpec> for SessionConfig {
    type Error = Error;

    fn try_from(spec: SessionConfigSpec) -> Result<Self> {
        let config = SessionConfig {
            repo_url: spec.repo_url,
            git_ref: spec.git_ref,
            limits: spec.limits,
            env: spec.env,
            owner: spec.owner,
            sync_git: spec.sync_git,
        };
        config.validate().into_result()?;
        Ok(config)
    }
}

impl From<SessionConfig> for SessionConfigSpec {
    fn from(config: SessionConfig) -> Self {
        Self {
            repo_url: config.repo_url,
            git_ref: config.git_ref,
            limits: config.limits,
            env: config.env,
            owner: config.owner,
            sync_git: config.sync_git,
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    repo_url: String,
    git_ref: String,
    limits: ResourceLimits,
    env: Vec<(String, String)>,
    owner: Option<GitUser>,
    sync_git: bool,
}

impl SessionConfigBuilder {
    /// Sets the branch, tag or commit to check out.
    pub fn git_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Adds an environment variable. Keys must be unique.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn owner(mut self, owner: GitUser) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn sync_git(mut self, sync_git: bool) -> Self {
        self.sync_git = sync_git;
        self
    }

    /// Validates and freezes the config.
    pub fn build(self) -> Result<SessionConfig> {
        let mut duplicates = ValidationResult::default();
        let mut env = BTreeMap::new();
        for (key, value) in self.env {
            if env.insert(key.clone(), value).is_some() {
                duplicates.add_error(format!("duplicate env key '{}'", key));
            }
        }

        let config = SessionConfig {
            repo_url: self.repo_url,
            git_ref: self.git_ref,
            limits: self.limits,
            env,
            owner: self.owner,
            sync_git: self.sync_git,
        };

        let mut result = config.validate();
        result.merge(duplicates);
        result.into_result()?;
        Ok(config)
    }
}

/// Identity of a provisioning request: repo, ref and owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisionKey {
    pub repo_url: String,
    pub git_ref: String,
    pub owner: String,
}

impl fmt::Display for ProvisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo_url, self.git_ref)?;
        if !self.owner.is_empty() {
            write!(f, " ({})", self.owner)?;
        }
        Ok(())
    }
}

fn validate_repo_url(repo_url: &str, result: &mut ValidationResult) {
    if repo_url.trim().is_empty() {
        result.add_error("repo_url cannot be empty");
        return;
    }
    if repo_url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        result.add_error(format!("repo_url '{}' contains whitespace", repo_url));
        return;
    }

    if repo_url.contains("://") {
        match url::Url::parse(repo_url) {
            Ok(parsed) => {
                if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
                    result.add_error(format!(
                        "repo_url scheme '{}' is not supported",
                        parsed.scheme()
                    ));
                } else if parsed.scheme() != "file" && parsed.host_str().is_none() {
                    result.add_error(format!("repo_url '{}' has no host", repo_url));
                }
                if parsed.scheme() == "http" {
                    result.add_warning("repo_url uses plain http");
                }
            }
            Err(e) => result.add_error(format!("repo_url '{}' is malformed: {}", repo_url, e)),
        }
        return;
    }

    // scp-like `git@host:owner/repo.git`
    if let Some((user_host, path)) = repo_url.split_once(':') {
        let host = user_host.rsplit('@').next().unwrap_or_default();
        if host.is_empty() || path.is_empty() {
            result.add_error(format!("repo_url '{}' is malformed", repo_url));
        }
        return;
    }

    // Shorthand `name` or `owner/name`.
    let segments: Vec<&str> = repo_url.split('/').collect();
    let valid_segment = |s: &&str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if segments.len() > 2 || !segments.iter().all(valid_segment) {
        result.add_error(format!("repo_url '{}' is not a valid repository reference", repo_url));
    }
}

fn validate_git_ref(git_ref: &str, result: &mut ValidationResult) {
    if git_ref.trim().is_empty() {
        result.add_error("git_ref cannot be empty");
        return;
    }
    let forbidden = |c: char| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c);
    if git_ref.starts_with('-') || git_ref.contains("..") || git_ref.chars().any(forbidden) {
        result.add_error(format!("git_ref '{}' is not a valid ref name", git_ref));
    }
}

fn validate_env_key(key: &str, result: &mut ValidationResult) {
    if key.is_empty() {
        result.add_error("env keys cannot be empty");
    } else if key.contains('=') || key.contains('\0') {
        result.add_error(format!("env key '{}' contains '=' or NUL", key));
    }
}
