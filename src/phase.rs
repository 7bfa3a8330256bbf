//! Phase definitions and JSON plan loading.
//!
//! A pipeline run is described by a plan: an ordered list of phases, each an
//! ordered list of command steps. Plans come from `plan.json` when present,
//! otherwise from the built-in reconnaissance / scanning / enumeration plan.
//! Command templates carry `{target}` and `{workspace}` placeholders that are
//! resolved when a step is dispatched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::executor::{CommandInvocation, ExecMode};

/// Tools the built-in plan shells out to. Checked against PATH before a run.
pub const DEFAULT_TOOLS: &[&str] = &[
    "host",
    "whois",
    "subfinder",
    "curl",
    "jq",
    "httpx",
    "theHarvester",
    "dnsx",
    "nmap",
    "masscan",
    "nikto",
    "gobuster",
    "nuclei",
];

/// Lifecycle of a phase during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

/// One command step inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Short label shown in status messages and reports.
    pub label: String,
    /// Command template, run via the shell after placeholder expansion.
    pub command: String,
    /// Per-step wall-clock limit in seconds, overriding the run default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Dispatch mode (defaults to sync).
    #[serde(default)]
    pub mode: ExecMode,
}

impl StepSpec {
    pub fn new(label: &str, command: &str) -> Self {
        Self {
            label: label.to_string(),
            command: command.to_string(),
            timeout_secs: None,
            mode: ExecMode::Sync,
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.mode = ExecMode::Async;
        self
    }

    /// Expand placeholders and bind the step to a working directory.
    pub fn resolve(&self, target: &str, workspace: &Path) -> CommandInvocation {
        let command = expand_placeholders(&self.command, target, workspace);
        CommandInvocation {
            command,
            workdir: workspace.to_path_buf(),
            timeout_secs: self.timeout_secs,
            mode: self.mode,
        }
    }
}

/// Represents a single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Human-readable name of the phase (e.g., "Reconnaissance")
    pub name: String,
    /// Ordered command steps; dispatched strictly in sequence
    pub steps: Vec<StepSpec>,
}

impl Phase {
    pub fn new(name: &str, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }

    /// Filesystem-safe identifier derived from the name. Used for the
    /// per-phase report directory and artifact file. Runs of non-alphanumeric
    /// characters collapse into a single `-`.
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        slug.trim_end_matches('-').to_string()
    }
}

/// Represents the full plan.json file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Timestamp when the plan was written
    #[serde(default)]
    pub generated_at: String,
    /// Ordered list of phases
    pub phases: Vec<Phase>,
}

impl PlanFile {
    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let plan: PlanFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;

        if plan.phases.is_empty() {
            anyhow::bail!("Plan file {} contains no phases", path.display());
        }

        Ok(plan)
    }

    /// Save the plan to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;

        Ok(())
    }
}

/// Expand `{target}` and `{workspace}` in a command template.
pub fn expand_placeholders(template: &str, target: &str, workspace: &Path) -> String {
    template
        .replace("{target}", target)
        .replace("{workspace}", &workspace.to_string_lossy())
}

/// The built-in plan used when no `plan.json` is supplied.
///
/// Three fixed phases, always in this order. Steps write their intermediate
/// artifacts (subdomain lists, resolved hosts) into the workspace so later
/// phases can pick them up.
pub fn default_plan() -> Vec<Phase> {
    vec![
        Phase::new(
            "Reconnaissance",
            vec![
                StepSpec::new("DNS lookup", "host {target}"),
                StepSpec::new("WHOIS", "whois {target}"),
                StepSpec::new(
                    "Subdomain discovery (subfinder)",
                    "subfinder -d {target} -oD ./ -o subfinder_results.md",
                ),
                StepSpec::new(
                    "Certificate transparency (crt.sh)",
                    "curl -s \"https://crt.sh/?q=%25.{target}&output=json\" | jq -r '.[].name_value' | sort -u > crtsh_subdomains.md",
                ),
                StepSpec::new(
                    "Merge subdomain lists",
                    "cat subfinder_results.md crtsh_subdomains.md 2>/dev/null | sort -u > all_subdomains.txt",
                ),
                StepSpec::new(
                    "High-value subdomains",
                    "grep -iE 'admin|api|vpn|dev|test|staging|internal|portal|login|db|mail|backup' all_subdomains.txt",
                ),
                StepSpec::new(
                    "Probe live hosts (httpx)",
                    "httpx -l all_subdomains.txt -title -status-code -tech-detect -follow-redirects -mc 200,301,302 -o live_subdomains.txt",
                ),
                StepSpec::new(
                    "OSINT harvest",
                    "theHarvester -d {target} -b crtsh,hackertarget,rapiddns",
                ),
            ],
        ),
        Phase::new(
            "Scanning",
            vec![
                StepSpec::new(
                    "Resolve hosts (dnsx)",
                    "cat all_subdomains.txt | dnsx -silent -a -aaaa -resp -o resolved_hosts.txt",
                ),
                StepSpec::new(
                    "Quick port scan (nmap)",
                    "nmap -sS -Pn -T4 -F -iL resolved_hosts.txt -oN nmap_quick.txt",
                ),
                StepSpec::new(
                    "Full port sweep (masscan)",
                    "masscan -p1-65535 --rate=1000 -iL resolved_hosts.txt --banners -oG masscan_results.txt",
                )
                .asynchronous(),
            ],
        ),
        Phase::new(
            "Enumeration",
            vec![
                StepSpec::new(
                    "Web server scan (nikto)",
                    "nikto -h $(head -n1 live_subdomains.txt | cut -d' ' -f1) -Tuning 1234567890 -o nikto_results.txt",
                ),
                StepSpec::new(
                    "Directory brute force (gobuster)",
                    "gobuster dir -u $(head -n1 live_subdomains.txt | cut -d' ' -f1) -w /usr/share/wordlists/dirb/common.txt -t 50 -x php,html,txt -o gobuster_results.txt",
                ),
                StepSpec::new(
                    "Template scan (nuclei)",
                    "nuclei -l live_subdomains.txt -severity low,medium,high,critical -o nuclei_results.txt",
                )
                .asynchronous(),
            ],
        ),
    ]
}

/// Check whether `name` resolves to an executable on PATH.
pub fn tool_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file() && is_executable(&candidate)
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Which of the named tools are absent from PATH, in input order.
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|t| !tool_on_path(t))
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_plan_has_three_phases_in_order() {
        let plan = default_plan();
        let names: Vec<_> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Reconnaissance", "Scanning", "Enumeration"]);
        for phase in &plan {
            assert!(!phase.steps.is_empty());
        }
    }

    #[test]
    fn test_resolve_expands_placeholders() {
        let dir = tempdir().unwrap();
        let step = StepSpec::new("lookup", "host {target}");
        let inv = step.resolve("example.com", dir.path());
        assert_eq!(inv.command, "host example.com");
        assert_eq!(inv.workdir, dir.path());
    }

    #[test]
    fn test_default_plan_resolves_without_leftover_placeholders() {
        let dir = tempdir().unwrap();
        for phase in default_plan() {
            for step in &phase.steps {
                let inv = step.resolve("example.com", dir.path());
                assert!(
                    !inv.command.contains("{target}") && !inv.command.contains("{workspace}"),
                    "unexpanded placeholder in: {}",
                    inv.command
                );
            }
        }
    }

    #[test]
    fn test_slug_is_filesystem_safe() {
        let phase = Phase::new("Web / App Enumeration", vec![]);
        assert_eq!(phase.slug(), "web-app-enumeration");
        assert_eq!(Phase::new("Reconnaissance", vec![]).slug(), "reconnaissance");
        assert_eq!(Phase::new("  Scanning!  ", vec![]).slug(), "scanning");
    }

    #[test]
    fn test_plan_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");

        let plan = PlanFile {
            generated_at: "2026-08-30T00:00:00Z".to_string(),
            phases: default_plan(),
        };
        plan.save(&path).unwrap();

        let loaded = PlanFile::load(&path).unwrap();
        assert_eq!(loaded.phases, plan.phases);
    }

    #[test]
    fn test_plan_file_rejects_empty_phases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"phases": []}"#).unwrap();
        assert!(PlanFile::load(&path).is_err());
    }

    #[test]
    fn test_plan_file_load_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(PlanFile::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_tool_on_path_finds_shell() {
        assert!(tool_on_path("sh"));
        assert!(!tool_on_path("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_missing_tools_preserves_order() {
        let missing = missing_tools(&["sh", "no-such-tool-1", "no-such-tool-2"]);
        assert_eq!(missing, ["no-such-tool-1", "no-such-tool-2"]);
    }
}
