use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};
use crate::types::{ContextBudget, Priority};

/// Top-level kernel configuration. Every section has defaults, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deepest allowed graph stack index. The root flow is depth 0.
    #[serde(default = "default_max_stack_depth")]
    pub max_stack_depth: usize,
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// How long an in-flight step may keep running after a stop request.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: default_max_stack_depth(),
            max_steps_per_run: default_max_steps_per_run(),
            step_timeout_secs: default_step_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            max_result_bytes: default_max_result_bytes(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

fn default_max_stack_depth() -> usize { 3 }
fn default_max_steps_per_run() -> usize { 200 }
fn default_step_timeout_secs() -> u64 { 600 }
fn default_stop_grace_secs() -> u64 { 30 }
fn default_max_result_bytes() -> usize { 1024 * 1024 }
fn default_event_bus_capacity() -> usize { 1024 }

/// History selection budgets, in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_total_chars")]
    pub total_chars: usize,
    #[serde(default = "default_recent_chars")]
    pub recent_chars: usize,
    #[serde(default = "default_older_chars")]
    pub older_chars: usize,
    /// Sanity floor applied to every budget value.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Sanity ceiling applied to every budget value.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_chars: default_total_chars(),
            recent_chars: default_recent_chars(),
            older_chars: default_older_chars(),
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
        }
    }
}

impl BudgetConfig {
    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.total_chars, self.recent_chars, self.older_chars)
    }
}

fn default_total_chars() -> usize { 200_000 }
fn default_recent_chars() -> usize { 60_000 }
fn default_older_chars() -> usize { 10_000 }
fn default_min_chars() -> usize { 100 }
fn default_max_chars() -> usize { 4_000_000 }

/// History priority classification.
///
/// Exact role matches win; otherwise the keyword patterns are tried from
/// the highest tier down; otherwise `default_tier` applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default)]
    pub default_tier: Priority,
    #[serde(default)]
    pub roles: HashMap<String, Priority>,
    /// Case-insensitive regex patterns matched against the role name.
    #[serde(default = "default_keywords")]
    pub keywords: BTreeMap<Priority, Vec<String>>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            default_tier: Priority::default(),
            roles: HashMap::new(),
            keywords: default_keywords(),
        }
    }
}

fn default_keywords() -> BTreeMap<Priority, Vec<String>> {
    let mut keywords = BTreeMap::new();
    keywords.insert(
        Priority::Critical,
        vec![
            "requirement".to_string(),
            "contract".to_string(),
            "decision".to_string(),
            "signoff".to_string(),
        ],
    );
    keywords.insert(
        Priority::High,
        vec![
            "critic".to_string(),
            "verif".to_string(),
            "review".to_string(),
            "test".to_string(),
            "gate".to_string(),
        ],
    );
    keywords.insert(
        Priority::Low,
        vec![
            "log".to_string(),
            "debug".to_string(),
            "trace".to_string(),
            "scratch".to_string(),
        ],
    );
    keywords
}

/// Storage locations. Relative paths resolve against `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_journal_db")]
    pub journal_db: String,
    #[serde(default = "default_projection_db")]
    pub projection_db: String,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            journal_db: default_journal_db(),
            projection_db: default_projection_db(),
            runs_dir: default_runs_dir(),
        }
    }
}

fn default_data_dir() -> String { "~/.stepflow".to_string() }
fn default_journal_db() -> String { "journal.db".to_string() }
fn default_projection_db() -> String { "projection.db".to_string() }
fn default_runs_dir() -> String { "runs".to_string() }

impl StorageConfig {
    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.resolve(&self.journal_db)
    }

    pub fn projection_path(&self) -> PathBuf {
        self.resolve(&self.projection_db)
    }

    pub fn runs_path(&self) -> PathBuf {
        self.resolve(&self.runs_dir)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = expand_home(path);
        if p.is_absolute() {
            p
        } else {
            self.data_dir().join(p)
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that cannot be clamped into something meaningful.
    fn check(&self) -> Result<()> {
        if self.budget.min_chars > self.budget.max_chars {
            return Err(StepflowError::Config(format!(
                "budget.min_chars ({}) exceeds budget.max_chars ({})",
                self.budget.min_chars, self.budget.max_chars
            )));
        }
        if self.orchestrator.max_steps_per_run == 0 {
            return Err(StepflowError::Config(
                "orchestrator.max_steps_per_run must be at least 1".into(),
            ));
        }
        if self.orchestrator.event_bus_capacity == 0 {
            return Err(StepflowError::Config(
                "orchestrator.event_bus_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
