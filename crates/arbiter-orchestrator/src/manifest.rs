//! Node manifest schema.
//!
//! Defines the structure of the YAML manifest file each node ships,
//! describing its identity, how to launch it, how to reach it, and what it
//! consumes and produces. Parsing is lenient: every field has a default so
//! an incomplete manifest still loads, and `validate()` reports what is
//! missing instead of failing the parse.

use arbiter_core::{ArbiterError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// How a node's process is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Runtime kind: "executable" launches directly, other kinds (script,
    /// library) need a wrapper.
    #[serde(rename = "type", default = "default_runtime_type")]
    pub kind: String,
    /// Command to launch, absolute or PATH-resolved.
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment variables set for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_runtime_type() -> String {
    "executable".to_string()
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            kind: default_runtime_type(),
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

/// How to reach a node once it is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationSpec {
    /// Wire protocol. Only "yamlrpc" is supported.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Protocol version tag.
    #[serde(default = "default_protocol_version")]
    pub version: String,
    /// Unix socket path the node listens on.
    #[serde(default)]
    pub socket_path: String,
    /// Methods the node claims to expose, beyond the standard surface.
    #[serde(default)]
    pub methods: Vec<String>,
}

fn default_protocol() -> String {
    "yamlrpc".to_string()
}

fn default_protocol_version() -> String {
    "1.0".to_string()
}

impl Default for CommunicationSpec {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            version: default_protocol_version(),
            socket_path: String::new(),
            methods: Vec::new(),
        }
    }
}

/// One named input a node accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InputSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    /// Value used when the input is omitted.
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

/// One named output a node produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

fn default_value_type() -> String {
    "string".to_string()
}

/// Resource ceilings a node declares for itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

fn default_memory() -> String {
    "128MB".to_string()
}

fn default_cpu() -> String {
    "100m".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_instances() -> u32 {
    1
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
            timeout_seconds: default_timeout_seconds(),
            max_instances: default_max_instances(),
        }
    }
}

/// What a node needs before it can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DependencySpec {
    /// System packages expected on the host.
    #[serde(default)]
    pub system: Vec<String>,
    /// Other node ids this node calls into.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Complete node manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeManifest {
    /// Unique node identifier.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub runtime: RuntimeSpec,

    #[serde(default)]
    pub communication: CommunicationSpec,

    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub dependencies: DependencySpec,

    /// Free-form annotations, preserved as-is.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Default for NodeManifest {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: default_version(),
            description: String::new(),
            runtime: RuntimeSpec::default(),
            communication: CommunicationSpec::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceLimits::default(),
            dependencies: DependencySpec::default(),
            metadata: BTreeMap::new(),
        }
    }
}

impl NodeManifest {
    /// Load a manifest from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ArbiterError::io_with_path(e, path))?;
        Self::from_yaml(&text).map_err(|e| ArbiterError::Manifest {
            message: e.to_string(),
            path: Some(path.to_path_buf()),
        })
    }

    /// Parse a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Collect validation problems without failing.
    ///
    /// An empty result means the manifest is complete enough to launch and
    /// connect. Problems are human-readable strings for logs and callers.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.id.is_empty() {
            problems.push("Missing required field: id".to_string());
        }
        if self.name.is_empty() {
            problems.push("Missing required field: name".to_string());
        }
        if self.runtime.command.is_empty() {
            problems.push("Missing required field: runtime.command".to_string());
        }
        if self.communication.socket_path.is_empty() {
            problems.push("Missing required field: communication.socket_path".to_string());
        }
        if self.communication.protocol != "yamlrpc" {
            problems.push(format!(
                "Unsupported communication protocol: {}",
                self.communication.protocol
            ));
        }

        problems
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Whether the runtime can be launched directly.
    pub fn is_executable(&self) -> bool {
        self.runtime.kind == "executable"
    }
}
