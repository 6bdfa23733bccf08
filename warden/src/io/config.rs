//! Daemon configuration stored in `warden.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Daemon configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// for a single repository checked out in the current directory; only
/// `github.repo` has no usable default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    /// Primary checkout of the repository being worked on.
    pub repo_path: PathBuf,

    /// Directory holding one worktree per work item.
    /// Defaults to `<repo parent>/<repo name>-worktrees`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_base: Option<PathBuf>,

    /// Persisted work-item state. Relative paths resolve against `repo_path`.
    pub state_file: PathBuf,

    /// Base branch for new work. Detected from `origin/HEAD` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    pub poll_interval_secs: u64,

    pub max_concurrent: usize,

    /// Drop `in_progress` records older than this many hours on each poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_hours: Option<u64>,

    /// Script run inside each fresh isolation before the agent starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<PathBuf>,

    pub setup_timeout_secs: u64,

    /// Shell commands run before each review (e.g. `["cargo clippy", "cargo test"]`).
    pub review_commands: Vec<String>,

    pub check_timeout_secs: u64,

    pub labels: LabelConfig,

    pub github: GithubConfig,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LabelConfig {
    /// Label that requests work on an issue or a review on a PR.
    pub trigger: String,
    /// Label added to issues once handled.
    pub done: String,
    /// Label added to PRs once reviewed.
    pub reviewed: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            trigger: "warden".to_string(),
            done: "warden-done".to_string(),
            reviewed: "warden-reviewed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GithubConfig {
    /// `owner/repo`.
    pub repo: String,
    pub api_url: String,
    /// PRs by these authors are reviewed even without the trigger label.
    pub review_authors: Vec<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            api_url: "https://api.github.com".to_string(),
            review_authors: Vec::new(),
        }
    }
}

impl GithubConfig {
    pub fn owner_and_name(&self) -> Result<(&str, &str)> {
        match self.repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((owner, name))
            }
            _ => Err(anyhow!(
                "github.repo must be in the form 'owner/repo' (got '{}')",
                self.repo
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub command: String,
    pub max_turns: u32,
    /// Wall-clock budget for one agent run.
    pub timeout_secs: u64,
    pub implement_tools: Vec<String>,
    pub review_tools: Vec<String>,
    /// Extra arguments inserted before the prompt.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            max_turns: 50,
            timeout_secs: 30 * 60,
            implement_tools: ["Bash", "Read", "Write", "Edit", "Glob", "Grep", "TodoWrite"]
                .map(String::from)
                .to_vec(),
            review_tools: ["Bash", "Read", "Glob", "Grep"].map(String::from).to_vec(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            worktree_base: None,
            state_file: PathBuf::from(".warden/state.json"),
            base_branch: None,
            poll_interval_secs: 60,
            max_concurrent: 2,
            stale_after_hours: None,
            setup_script: None,
            setup_timeout_secs: 10 * 60,
            review_commands: Vec::new(),
            check_timeout_secs: 10 * 60,
            labels: LabelConfig::default(),
            github: GithubConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        self.github.owner_and_name()?;
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be > 0");
        }
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be > 0");
        }
        if self.agent.timeout_secs == 0 {
            bail!("agent.timeout_secs must be > 0");
        }
        if self.agent.max_turns == 0 {
            bail!("agent.max_turns must be > 0");
        }
        if self.agent.command.trim().is_empty() {
            bail!("agent.command must be non-empty");
        }
        if self.check_timeout_secs == 0 || self.setup_timeout_secs == 0 {
            bail!("check_timeout_secs and setup_timeout_secs must be > 0");
        }
        if self.stale_after_hours == Some(0) {
            bail!("stale_after_hours must be > 0 when set");
        }
        for label in [&self.labels.trigger, &self.labels.done, &self.labels.reviewed] {
            if label.trim().is_empty() {
                bail!("labels must be non-empty");
            }
        }
        if self.review_commands.iter().any(|c| c.trim().is_empty()) {
            bail!("review_commands must not contain empty commands");
        }
        Ok(())
    }

    /// Absolute state file path (relative paths resolve against `repo_path`).
    pub fn state_file_path(&self) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            self.repo_path.join(&self.state_file)
        }
    }

    pub fn worktree_base_path(&self) -> PathBuf {
        if let Some(base) = &self.worktree_base {
            return if base.is_absolute() {
                base.clone()
            } else {
                self.repo_path.join(base)
            };
        }
        let name = self
            .repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let parent = self
            .repo_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.repo_path.clone());
        parent.join(format!("{name}-worktrees"))
    }

    pub fn setup_script_path(&self) -> Option<PathBuf> {
        self.setup_script.as_ref().map(|script| {
            if script.is_absolute() {
                script.clone()
            } else {
                self.repo_path.join(script)
            }
        })
    }

    /// Apply `WARDEN_*` environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(repo) = lookup("WARDEN_REPO").filter(|v| !v.trim().is_empty()) {
            self.github.repo = repo.trim().to_string();
        }
        if let Some(raw) = lookup("WARDEN_MAX_CONCURRENT") {
            self.max_concurrent = raw
                .trim()
                .parse()
                .with_context(|| format!("WARDEN_MAX_CONCURRENT is not a number: '{raw}'"))?;
        }
        if let Some(raw) = lookup("WARDEN_POLL_INTERVAL") {
            self.poll_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("WARDEN_POLL_INTERVAL is not a number: '{raw}'"))?;
        }
        Ok(())
    }

    /// Make `repo_path` absolute so every derived path is stable.
    fn absolutize(&mut self) -> Result<()> {
        let resolved = fs::canonicalize(&self.repo_path)
            .with_context(|| format!("resolve repo_path {}", self.repo_path.display()))?;
        self.repo_path = resolved;
        Ok(())
    }
}

/// Load config from a TOML file, apply environment overrides, and validate.
///
/// If the file is missing, starts from `WardenConfig::default()`.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.absolutize()?;
    cfg.validate()?;
    debug!(repo = %cfg.github.repo, repo_path = %cfg.repo_path.display(), "config loaded");
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        return Ok(WardenConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Render the effective configuration for display.
pub fn render_config(cfg: &WardenConfig) -> Result<String> {
    toml::to_string_pretty(cfg).context("serialize config toml")
}

/// Resolve the API token from `GITHUB_TOKEN`, falling back to `gh auth token`.
pub fn resolve_token() -> Result<String> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN")
        && !token.trim().is_empty()
    {
        return Ok(token.trim().to_string());
    }
    let output = Command::new("gh").args(["auth", "token"]).output();
    match output {
        Ok(out) if out.status.success() => {
            let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if token.is_empty() {
                bail!("`gh auth token` returned an empty token");
            }
            Ok(token)
        }
        _ => Err(anyhow!(
            "GITHUB_TOKEN is not set and `gh auth token` failed; export a token or run `gh auth login`"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> WardenConfig {
        WardenConfig {
            github: GithubConfig {
                repo: "acme/widgets".to_string(),
                ..GithubConfig::default()
            },
            ..WardenConfig::default()
        }
    }

    #[test]
    fn missing_file_reads_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = read_config_file(&temp.path().join("missing.toml")).expect("read");
        assert_eq!(cfg, WardenConfig::default());
    }

    #[test]
    fn defaults_require_a_repo() {
        let err = WardenConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("owner/repo"));
        valid().validate().expect("valid");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("warden.toml");
        fs::write(
            &path,
            "max_concurrent = 4\nreview_commands = [\"cargo test\"]\n\n[github]\nrepo = \"acme/widgets\"\n\n[agent]\nmax_turns = 10\n",
        )
        .expect("write");
        let cfg = read_config_file(&path).expect("read");
        assert_eq!(cfg.max_concurrent, 4);
        assert_eq!(cfg.review_commands, vec!["cargo test".to_string()]);
        assert_eq!(cfg.agent.max_turns, 10);
        assert_eq!(cfg.agent.command, "claude");
        assert_eq!(cfg.labels.trigger, "warden");
        cfg.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_zero_limits() {
        let mut cfg = valid();
        cfg.max_concurrent = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.stale_after_hours = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.github.repo = "no-slash".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let mut cfg = WardenConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "WARDEN_REPO" => Some("acme/gadgets".to_string()),
            "WARDEN_MAX_CONCURRENT" => Some("3".to_string()),
            _ => None,
        })
        .expect("overrides");
        assert_eq!(cfg.github.repo, "acme/gadgets");
        assert_eq!(cfg.max_concurrent, 3);

        let err = cfg
            .apply_env_overrides(|key| (key == "WARDEN_POLL_INTERVAL").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WARDEN_POLL_INTERVAL"));
    }

    #[test]
    fn derived_paths_resolve_against_repo() {
        let cfg = WardenConfig {
            repo_path: PathBuf::from("/srv/widgets"),
            ..valid()
        };
        assert_eq!(cfg.state_file_path(), PathBuf::from("/srv/widgets/.warden/state.json"));
        assert_eq!(cfg.worktree_base_path(), PathBuf::from("/srv/widgets-worktrees"));

        let cfg = WardenConfig {
            worktree_base: Some(PathBuf::from("/tmp/wt")),
            ..cfg
        };
        assert_eq!(cfg.worktree_base_path(), PathBuf::from("/tmp/wt"));
    }

    #[test]
    fn rendered_config_parses_back() {
        let cfg = valid();
        let rendered = render_config(&cfg).expect("render");
        let parsed: WardenConfig = toml::from_str(&rendered).expect("parse");
        assert_eq!(parsed, cfg);
    }
}
