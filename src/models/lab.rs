use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabStatus {
    Creating,
    Starting,
    Running,
    Stopped,
    Paused,
    Error,
    Deleted,
}

impl LabStatus {
    pub fn can_transition_to(&self, target: &LabStatus) -> bool {
        match (self, target) {
            // Deletion is reachable from every state
            (_, LabStatus::Deleted) => true,

            // From CREATING
            (LabStatus::Creating, LabStatus::Starting) => true,
            (LabStatus::Creating, LabStatus::Error) => true,

            // From STARTING
            (LabStatus::Starting, LabStatus::Running) => true,
            (LabStatus::Starting, LabStatus::Error) => true,

            // From RUNNING
            (LabStatus::Running, LabStatus::Stopped) => true, // pause
            (LabStatus::Running, LabStatus::Error) => true,

            // From STOPPED
            (LabStatus::Stopped, LabStatus::Starting) => true, // resume
            (LabStatus::Stopped, LabStatus::Error) => true,

            // From ERROR (retry via resume)
            (LabStatus::Error, LabStatus::Starting) => true,

            _ => false,
        }
    }

    /// States where provisioning is still in flight. The reaper never
    /// touches labs in these states regardless of timestamps.
    pub fn is_transitional(&self) -> bool {
        matches!(self, LabStatus::Creating | LabStatus::Starting)
    }

    /// Map a container engine status string onto the lifecycle model.
    /// Unrecognized strings mean the engine is in a state this layer does
    /// not understand, which is reported as ERROR.
    pub fn from_engine(status: &str) -> LabStatus {
        match status {
            "running" => LabStatus::Running,
            "exited" => LabStatus::Stopped,
            "paused" => LabStatus::Paused,
            "restarting" => LabStatus::Starting,
            "created" => LabStatus::Creating,
            _ => LabStatus::Error,
        }
    }
}

/// Fixed IDE service table. Each service listens on a well-known port inside
/// the container and probes for an external port in its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdeType {
    Vscode,
    Jupyter,
    Intellij,
    Terminal,
}

impl IdeType {
    pub const ALL: [IdeType; 4] = [
        IdeType::Vscode,
        IdeType::Jupyter,
        IdeType::Intellij,
        IdeType::Terminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdeType::Vscode => "vscode",
            IdeType::Jupyter => "jupyter",
            IdeType::Intellij => "intellij",
            IdeType::Terminal => "terminal",
        }
    }

    /// Port the service listens on inside the container.
    pub fn internal_port(&self) -> u16 {
        match self {
            IdeType::Vscode => 8080,
            IdeType::Jupyter => 8888,
            IdeType::Intellij => 8081,
            IdeType::Terminal => 8082,
        }
    }

    /// Offset of this service's probe window above the configured range
    /// start, so concurrent services never contend for the same ports.
    pub fn port_offset(&self) -> u16 {
        match self {
            IdeType::Vscode => 0,
            IdeType::Jupyter => 100,
            IdeType::Intellij => 200,
            IdeType::Terminal => 300,
        }
    }

    /// Container port key in the engine's `{port}/tcp` convention.
    pub fn port_spec(&self) -> String {
        format!("{}/tcp", self.internal_port())
    }

    pub fn parse(value: &str) -> Option<IdeType> {
        match value {
            "vscode" => Some(IdeType::Vscode),
            "jupyter" => Some(IdeType::Jupyter),
            "intellij" => Some(IdeType::Intellij),
            "terminal" => Some(IdeType::Terminal),
            _ => None,
        }
    }
}

/// Per-request lab options. Every field has a default so an empty request
/// produces a usable single-IDE Python lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default = "default_ide")]
    pub ide_type: IdeType,
    #[serde(default)]
    pub enable_multi_ide: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64, // number of CPUs (e.g. 1.5)
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64, // memory in bytes
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            ide_type: default_ide(),
            enable_multi_ide: false,
            language: default_language(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            environment_vars: HashMap::new(),
            image: None,
        }
    }
}

impl LabConfig {
    /// Services this lab needs external ports for.
    pub fn required_services(&self) -> Vec<IdeType> {
        if self.enable_multi_ide {
            IdeType::ALL.to_vec()
        } else {
            vec![self.ide_type]
        }
    }

    /// Image to run: an explicit override wins, otherwise the naming
    /// convention `{prefix}/{ide}-{language}:{tag}`. Multi-IDE images bundle
    /// all four services in one image per language-agnostic build.
    pub fn resolve_image(&self, prefix: &str, tag: &str) -> String {
        if let Some(image) = &self.image {
            return image.clone();
        }
        if self.enable_multi_ide {
            format!("{}/multi-ide:{}", prefix, tag)
        } else {
            format!("{}/{}-{}:{}", prefix, self.ide_type.as_str(), self.language, tag)
        }
    }
}

fn default_ide() -> IdeType {
    IdeType::Vscode
}

fn default_language() -> String {
    "python".to_string()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_memory_limit() -> i64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

/// A provisioned (or provisioning) student lab environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabEnvironment {
    pub id: Uuid,
    pub student_id: String,
    pub course_id: String,
    pub container_name: String,
    pub container_id: Option<String>,
    pub status: LabStatus,
    pub config: LabConfig,
    pub ports: HashMap<String, u16>, // "8080/tcp" -> host port
    pub persistent_storage_path: PathBuf,
    pub ide_urls: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl LabEnvironment {
    /// Instant the idle clock runs from. Labs that were never accessed age
    /// from their creation time.
    pub fn idle_since(&self) -> DateTime<Utc> {
        self.last_accessed.unwrap_or(self.created_at)
    }

    pub fn touch(&mut self) {
        self.last_accessed = Some(Utc::now());
    }
}

/// Derive browser-facing URLs from allocated port bindings using the fixed
/// IDE service table. Bindings for ports outside the table are ignored.
pub fn derive_ide_urls(ports: &HashMap<String, u16>, host: &str) -> HashMap<String, String> {
    let mut urls = HashMap::new();
    for ide in IdeType::ALL {
        if let Some(port) = ports.get(&ide.port_spec()) {
            urls.insert(
                ide.as_str().to_string(),
                format!("http://{}:{}", host, port),
            );
        }
    }
    urls
}

/// Uniform envelope for lifecycle operation outcomes. Collaborator failures
/// are folded into `success = false` rather than escaping as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabOperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub lab_id: Option<Uuid>,
    #[serde(default)]
    pub urls: Option<HashMap<String, String>>,
    #[serde(default)]
    pub status: Option<LabStatus>,
}

impl LabOperationResult {
    pub fn ok(message: impl Into<String>, lab: &LabEnvironment) -> Self {
        Self {
            success: true,
            message: message.into(),
            lab_id: Some(lab.id),
            urls: if lab.ide_urls.is_empty() {
                None
            } else {
                Some(lab.ide_urls.clone())
            },
            status: Some(lab.status),
        }
    }

    pub fn deleted(message: impl Into<String>, lab_id: Option<Uuid>) -> Self {
        Self {
            success: true,
            message: message.into(),
            lab_id,
            urls: None,
            status: Some(LabStatus::Deleted),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            lab_id: None,
            urls: None,
            status: None,
        }
    }

    pub fn failure_for(message: impl Into<String>, lab_id: Uuid, status: LabStatus) -> Self {
        Self {
            success: false,
            message: message.into(),
            lab_id: Some(lab_id),
            urls: None,
            status: Some(status),
        }
    }
}
