//! Job specifications and layer manifests.
//!
//! A [`JobSpec`] is everything a worker needs to run one job hermetically: the
//! program, its arguments and environment, the identity it runs as, extra mounts and
//! resource limits. The root filesystem comes from the [`LayerManifest`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::LayerDigest;

/// Why a job specification was refused at submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job spec: {0}")]
pub struct InvalidSpec(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobMount {
    /// Expose a host path inside the container.
    Bind {
        source: String,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
    /// Fresh tmpfs.
    Tmp { target: String },
    /// procfs for the job's own PID namespace.
    Proc { target: String },
}

impl JobMount {
    pub fn target(&self) -> &str {
        match self {
            JobMount::Bind { target, .. } | JobMount::Tmp { target } | JobMount::Proc { target } => {
                target
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Address-space limit for every process in the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
}

impl ResourceLimits {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_working_directory() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    #[serde(default)]
    pub user: u32,
    #[serde(default)]
    pub group: u32,
    #[serde(default)]
    pub mounts: Vec<JobMount>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub enable_loopback: bool,
    #[serde(default = "default_true")]
    pub writable_root: bool,
}

impl JobSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: default_working_directory(),
            user: 0,
            group: 0,
            mounts: Vec::new(),
            limits: ResourceLimits::default(),
            enable_loopback: false,
            writable_root: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, mount: JobMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check everything that can be checked without touching a worker.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        require_absolute("program", &self.program)?;
        require_absolute("working directory", &self.working_directory)?;

        for arg in &self.arguments {
            require_no_nul("argument", arg)?;
        }
        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') {
                return Err(InvalidSpec(format!(
                    "environment key {key:?} must be non-empty and must not contain '='"
                )));
            }
            require_no_nul("environment key", key)?;
            require_no_nul("environment value", value)?;
        }

        for mount in &self.mounts {
            let target = mount.target();
            require_absolute("mount target", target)?;
            if Path::new(target) == Path::new("/") {
                return Err(InvalidSpec("cannot mount over the root directory".into()));
            }
            if let JobMount::Bind { source, .. } = mount {
                require_absolute("bind mount source", source)?;
            }
        }

        let limits = &self.limits;
        if limits.timeout_ms == Some(0) {
            return Err(InvalidSpec("timeout must be greater than zero".into()));
        }
        if limits.memory_bytes == Some(0) {
            return Err(InvalidSpec("memory limit must be greater than zero".into()));
        }
        if limits.cpu_seconds == Some(0) {
            return Err(InvalidSpec("cpu limit must be greater than zero".into()));
        }
        Ok(())
    }
}

fn require_no_nul(what: &str, value: &str) -> Result<(), InvalidSpec> {
    if value.contains('\0') {
        return Err(InvalidSpec(format!("{what} contains a NUL byte")));
    }
    Ok(())
}

fn require_absolute(what: &str, value: &str) -> Result<(), InvalidSpec> {
    require_no_nul(what, value)?;
    if !value.starts_with('/') {
        return Err(InvalidSpec(format!("{what} {value:?} must be an absolute path")));
    }
    if Path::new(value)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(InvalidSpec(format!("{what} {value:?} must not contain '..'")));
    }
    Ok(())
}

/// Ordered list of layers forming a job's root filesystem, lowest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerManifest {
    pub layers: Vec<LayerDigest>,
}

impl LayerManifest {
    pub fn new(layers: Vec<LayerDigest>) -> Self {
        Self { layers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDigest> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Distinct digests in first-seen order.
    pub fn unique(&self) -> Vec<LayerDigest> {
        let mut seen = std::collections::HashSet::new();
        self.layers
            .iter()
            .filter(|d| seen.insert(**d))
            .copied()
            .collect()
    }
}

impl FromIterator<LayerDigest> for LayerManifest {
    fn from_iter<T: IntoIterator<Item = LayerDigest>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_valid() {
        assert!(JobSpec::new("/bin/true").validate().is_ok());
    }

    #[test]
    fn relative_program_is_rejected() {
        let err = JobSpec::new("true").validate().unwrap_err();
        assert!(err.0.contains("absolute"));
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let mut spec = JobSpec::new("/bin/true");
        spec.working_directory = "/tmp/../etc".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn zero_limits_are_malformed() {
        let mut spec = JobSpec::new("/bin/true");
        spec.limits.timeout_ms = Some(0);
        assert!(spec.validate().is_err());

        let mut spec = JobSpec::new("/bin/true");
        spec.limits.memory_bytes = Some(0);
        assert!(spec.validate().is_err());

        let mut spec = JobSpec::new("/bin/true");
        spec.limits.cpu_seconds = Some(0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn environment_keys_are_checked() {
        assert!(JobSpec::new("/bin/true").env("A=B", "c").validate().is_err());
        assert!(JobSpec::new("/bin/true").env("", "c").validate().is_err());
        assert!(JobSpec::new("/bin/true").env("PATH", "/bin").validate().is_ok());
    }

    #[test]
    fn mounts_need_absolute_paths() {
        let spec = JobSpec::new("/bin/true").mount(JobMount::Bind {
            source: "relative".into(),
            target: "/mnt".into(),
            read_only: true,
        });
        assert!(spec.validate().is_err());

        let spec = JobSpec::new("/bin/true").mount(JobMount::Tmp { target: "/".into() });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_json_defaults() {
        let spec: JobSpec = serde_json::from_str(r#"{"program": "/bin/echo"}"#).unwrap();
        assert_eq!(spec.working_directory, "/");
        assert!(spec.writable_root);
        assert!(spec.mounts.is_empty());
        assert_eq!(spec.limits, ResourceLimits::default());
    }

    #[test]
    fn mount_json_is_tagged() {
        let mount: JobMount =
            serde_json::from_str(r#"{"type": "bind", "source": "/usr", "target": "/usr"}"#)
                .unwrap();
        assert_eq!(
            mount,
            JobMount::Bind {
                source: "/usr".into(),
                target: "/usr".into(),
                read_only: false
            }
        );
    }

    #[test]
    fn manifest_unique_keeps_first_occurrence() {
        let a = LayerDigest::from(1u64);
        let b = LayerDigest::from(2u64);
        let manifest = LayerManifest::new(vec![a, b, a]);
        assert_eq!(manifest.unique(), vec![a, b]);
        assert_eq!(manifest.len(), 3);
    }
}
