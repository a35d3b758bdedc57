//! Configuration models for stagehand.
//!
//! Everything a stage needs at runtime is parameterized here and passed into
//! the engine explicitly. There are no process-wide paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for stagehand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where job registries, progress records and stop flags live
    #[serde(default)]
    pub state: StateConfig,

    /// Default run parameters
    #[serde(default)]
    pub engine: EngineConfig,

    /// Anonymizing circuit process
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// HTTP session settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Text-generation endpoint used by `completion` stages
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Per-row retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pipeline stages keyed by stage id
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory for the file-backed job store
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// Default run parameters, overridable per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows per window
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum rows in scope for one run
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Successful lookups between identity rotations (0 disables)
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: usize,

    /// Pause between consecutive lookups
    #[serde(default = "default_row_delay_ms")]
    pub row_delay_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_rows() -> usize {
    2000
}

fn default_rotation_interval() -> usize {
    30
}

fn default_row_delay_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_rows: default_max_rows(),
            rotation_interval: default_rotation_interval(),
            row_delay_ms: default_row_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn row_delay(&self) -> Duration {
        Duration::from_millis(self.row_delay_ms)
    }
}

/// Anonymizing circuit process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Executable to launch (e.g. a tor binary)
    #[serde(default = "default_circuit_program")]
    pub program: PathBuf,

    /// Extra arguments for the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Local SOCKS port exposed by the circuit
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Wait after tearing down the old circuit
    #[serde(default = "default_settle_after_stop")]
    pub settle_after_stop_secs: u64,

    /// Wait for a fresh circuit to become usable
    #[serde(default = "default_settle_after_start")]
    pub settle_after_start_secs: u64,
}

fn default_circuit_program() -> PathBuf {
    PathBuf::from("tor")
}

fn default_socks_port() -> u16 {
    9050
}

fn default_settle_after_stop() -> u64 {
    5
}

fn default_settle_after_start() -> u64 {
    7
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            program: default_circuit_program(),
            args: Vec::new(),
            socks_port: default_socks_port(),
            settle_after_stop_secs: default_settle_after_stop(),
            settle_after_start_secs: default_settle_after_start(),
        }
    }
}

impl CircuitConfig {
    pub fn settle_after_stop(&self) -> Duration {
        Duration::from_secs(self.settle_after_stop_secs)
    }

    pub fn settle_after_start(&self) -> Duration {
        Duration::from_secs(self.settle_after_start_secs)
    }

    pub fn proxy_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.socks_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("stagehand/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (may contain ${ENV_VAR} placeholders)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is unset
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    128
}

fn default_temperature() -> f64 {
    0.2
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per lookup, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Deadline for a single attempt; an attempt that outlives it counts as a timeout
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

/// Which lookup adapter drives a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Text-generation lookup over one field
    Completion,
    /// Web page probe over a URL field
    Probe,
}

/// One pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: StageKind,

    /// Directory relative input names are resolved against
    #[serde(default)]
    pub input_dir: Option<PathBuf>,

    /// Directory the checkpointed output snapshot is written to
    pub output_dir: PathBuf,

    /// Prefix prepended to the input file name to form the output name
    #[serde(default)]
    pub output_prefix: String,

    /// Columns the input table must carry
    #[serde(default)]
    pub required_columns: Vec<String>,

    /// Field the lookup reads
    pub source_field: String,

    /// Field the lookup writes
    pub target_field: String,

    /// Terminal status pruned from the table after a completed run
    #[serde(default)]
    pub prune_status: Option<String>,

    /// Route the session through the anonymizing circuit
    #[serde(default)]
    pub use_circuit: bool,

    /// System prompt (completion stages)
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Lower-cased page fragments that mean "you are being throttled" (probe stages)
    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
}

fn default_block_markers() -> Vec<String> {
    vec![
        "too many requests".to_string(),
        "access denied".to_string(),
        "your request has been blocked".to_string(),
    ]
}

impl StageConfig {
    /// Resolve an input reference to a path.
    pub fn input_path(&self, input: &Path) -> PathBuf {
        match &self.input_dir {
            Some(dir) if input.is_relative() => dir.join(input),
            _ => input.to_path_buf(),
        }
    }

    /// Output snapshot path for an input reference.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.output_dir.join(format!("{}{}", self.output_prefix, name))
    }

    /// Required columns, always including the field the lookup reads.
    pub fn all_required_columns(&self) -> Vec<String> {
        let mut cols = self.required_columns.clone();
        if !cols.contains(&self.source_field) {
            cols.push(self.source_field.clone());
        }
        cols
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a stage by id.
    pub fn stage(&self, stage_id: &str) -> Result<&StageConfig, ConfigError> {
        self.stages
            .get(stage_id)
            .ok_or_else(|| ConfigError::UnknownStage(stage_id.to_string()))
    }

    /// Resolve the completion API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.completion.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.completion.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.completion.api_key_env.clone(),
        })
    }

    /// Check the cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.batch_size == 0 {
            return Err(ConfigError::Invalid("engine.batch_size must be at least 1".into()));
        }
        for (id, stage) in &self.stages {
            if !is_valid_stage_id(id) {
                return Err(ConfigError::Invalid(format!(
                    "stage id '{id}' may only contain letters, digits, '_' and '-'"
                )));
            }
            if stage.source_field.is_empty() || stage.target_field.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage '{id}' needs both source_field and target_field"
                )));
            }
            if stage.kind == StageKind::Completion && stage.system_prompt.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "completion stage '{id}' needs a system_prompt"
                )));
            }
        }
        Ok(())
    }
}

/// Stage ids end up in file names, so keep them to a safe alphabet.
pub fn is_valid_stage_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };
    let mut result = s.to_string();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or completion.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Unknown stage: '{0}' (not configured under [stages.*])")]
    UnknownStage(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[state]
dir = "/tmp/stagehand-state"

[engine]
batch_size = 10
rotation_interval = 5

[stages.normalize_names]
kind = "completion"
output_dir = "data/normalized"
output_prefix = "Normalized_"
required_columns = ["Company"]
source_field = "Full Name"
target_field = "Normalized Name"
system_prompt = "Return the person's first and last name only."

[stages.probe_sites]
kind = "probe"
input_dir = "data/normalized"
output_dir = "data/probed"
source_field = "Website"
target_field = "Website Title"
prune_status = "no_result"
use_circuit = true
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.engine.batch_size, 10);
        assert_eq!(config.engine.max_rows, 2000);
        assert_eq!(config.engine.rotation_interval, 5);
        assert_eq!(config.circuit.socks_port, 9050);
        assert_eq!(config.retry.max_attempts, 2);

        let probe = config.stage("probe_sites").unwrap();
        assert_eq!(probe.kind, StageKind::Probe);
        assert!(probe.use_circuit);
        assert_eq!(probe.prune_status.as_deref(), Some("no_result"));
        assert!(!probe.block_markers.is_empty());
    }

    #[test]
    fn test_stage_paths() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let stage = config.stage("normalize_names").unwrap();
        assert_eq!(
            stage.output_path(Path::new("leads.jsonl")),
            PathBuf::from("data/normalized/Normalized_leads.jsonl")
        );
        assert_eq!(
            stage.all_required_columns(),
            vec!["Company".to_string(), "Full Name".to_string()]
        );

        let probe = config.stage("probe_sites").unwrap();
        assert_eq!(
            probe.input_path(Path::new("x.jsonl")),
            PathBuf::from("data/normalized/x.jsonl")
        );
    }

    #[test]
    fn test_unknown_stage() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert!(matches!(
            config.stage("nope"),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_completion_stage_requires_prompt() {
        let bad = r#"
[stages.names]
kind = "completion"
output_dir = "out"
source_field = "a"
target_field = "b"
"#;
        assert!(matches!(
            Config::from_toml(bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_stage_id_alphabet() {
        assert!(is_valid_stage_id("step-7_verify"));
        assert!(!is_valid_stage_id("../etc"));
        assert!(!is_valid_stage_id(""));
    }
}
