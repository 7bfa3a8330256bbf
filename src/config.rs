//! Runtime configuration.
//!
//! Settings come from three layers: built-in defaults, an optional
//! `reconflow.toml` in the output directory, and CLI flags. CLI flags win.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tracker::{DEFAULT_OUTPUT_CAP, DEFAULT_STATUS_CAP};

/// Config file name looked up in the output directory.
pub const CONFIG_FILE: &str = "reconflow.toml";

fn default_continue_on_error() -> bool {
    true
}

fn default_grace_secs() -> u64 {
    2
}

fn default_status_cap() -> usize {
    DEFAULT_STATUS_CAP
}

fn default_output_cap() -> usize {
    DEFAULT_OUTPUT_CAP
}

/// On-disk configuration file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub display: DisplaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Keep going past failed steps (default true).
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
    /// Default per-step timeout; steps may override in the plan.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Seconds between SIGTERM and SIGKILL when terminating a step.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            continue_on_error: default_continue_on_error(),
            step_timeout_secs: None,
            grace_secs: default_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySection {
    /// Skip the dashboard and print status lines instead.
    #[serde(default)]
    pub plain: bool,
    /// Bounded status feed size.
    #[serde(default = "default_status_cap")]
    pub status_cap: usize,
    /// Bounded live-output buffer size.
    #[serde(default = "default_output_cap")]
    pub output_cap: usize,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            plain: false,
            status_cap: default_status_cap(),
            output_cap: default_output_cap(),
        }
    }
}

impl ConfigToml {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reconflow.toml")
    }

    /// Load from `<dir>/reconflow.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }
}

/// Resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub target: String,
    /// Output directory; also the working directory for every step.
    pub workspace: PathBuf,
    /// Explicit plan file, when the user supplied one.
    pub plan_file: Option<PathBuf>,
    pub continue_on_error: bool,
    pub step_timeout_secs: Option<u64>,
    pub grace_secs: u64,
    pub plain: bool,
    pub status_cap: usize,
    pub output_cap: usize,
    pub verbose: bool,
    pub log_dir: PathBuf,
}

/// CLI-provided values that override the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub plain: bool,
    pub continue_on_error: Option<bool>,
    pub step_timeout_secs: Option<u64>,
    pub plan_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    /// Validate inputs and merge the file layer with CLI overrides.
    pub fn resolve(target: &str, output: PathBuf, overrides: Overrides) -> Result<Self> {
        validate_target(target)?;

        if !output.exists() {
            bail!("Output path {} does not exist", output.display());
        }
        if !output.is_dir() {
            bail!("Output path {} is not a directory", output.display());
        }
        let workspace = output
            .canonicalize()
            .context("Failed to resolve output directory")?;

        let file = ConfigToml::load_or_default(&workspace)?;

        let plan_file = match overrides.plan_file {
            Some(path) => Some(
                path.canonicalize()
                    .with_context(|| format!("Failed to resolve plan file: {}", path.display()))?,
            ),
            None => {
                let default = workspace.join("plan.json");
                default.exists().then_some(default)
            }
        };

        let log_dir = workspace.join(".reconflow").join("logs");

        Ok(Self {
            target: target.to_string(),
            workspace,
            plan_file,
            continue_on_error: overrides
                .continue_on_error
                .unwrap_or(file.run.continue_on_error),
            step_timeout_secs: overrides
                .step_timeout_secs
                .or(file.run.step_timeout_secs),
            grace_secs: file.run.grace_secs,
            plain: overrides.plain || file.display.plain,
            status_cap: file.display.status_cap,
            output_cap: file.display.output_cap,
            verbose: overrides.verbose,
            log_dir,
        })
    }
}

/// Targets are embedded into shell command lines, so only hostname
/// characters are accepted.
fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        bail!("Target domain must not be empty");
    }
    let ok = target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !ok {
        bail!("Target {target:?} contains characters not valid in a domain name");
    }
    Ok(())
}
