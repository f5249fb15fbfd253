use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, loaded only when present.
pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WardenConfig {
    pub child: ChildConfig,
    pub shutdown: ShutdownSettings,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ChildConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub helper_command: Option<PathBuf>,
    pub helper_args: Vec<String>,
    pub text: Option<String>,
    pub timeout_secs: u64,
    pub absolute_timeout_secs: u64,
    pub stop_file: Option<PathBuf>,
    pub stop_poll_millis: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct StatusConfig {
    pub file: Option<PathBuf>,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            helper_command: None,
            helper_args: Vec::new(),
            text: None,
            timeout_secs: 30,
            absolute_timeout_secs: 60,
            stop_file: None,
            stop_poll_millis: 1000,
        }
    }
}

/// A program plus its argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a command from trailing CLI tokens.
    ///
    /// A single token containing whitespace is split on whitespace, so
    /// `warden "java -jar server.jar"` and `warden java -jar server.jar` agree.
    pub fn from_tokens(tokens: &[String]) -> Option<Self> {
        let split: Vec<String> = match tokens {
            [single] => single.split_whitespace().map(str::to_string).collect(),
            _ => tokens.to_vec(),
        };
        let (program, args) = split.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self::new(program, args.to_vec()))
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What the coordinator does to ask the child to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownStrategy {
    /// Close the child's streams and rely on the absolute deadline.
    None,
    /// Run a helper and relay its output into the child's stdin.
    Helper(CommandSpec),
    /// Write one literal line to the child's stdin.
    Text(String),
}

impl ShutdownStrategy {
    /// Pick the strategy from independently configured values.
    ///
    /// Blank values count as unset. The helper wins over text.
    pub fn resolve(helper: Option<CommandSpec>, text: Option<String>) -> Self {
        let helper = helper.filter(|h| !h.program.as_os_str().to_string_lossy().trim().is_empty());
        let text = text.filter(|t| !t.trim().is_empty());
        match (helper, text) {
            (Some(helper), Some(text)) => {
                tracing::warn!(
                    helper = %helper,
                    text = %text,
                    "both a shutdown command and shutdown text are configured; using the command"
                );
                ShutdownStrategy::Helper(helper)
            }
            (Some(helper), None) => ShutdownStrategy::Helper(helper),
            (None, Some(text)) => ShutdownStrategy::Text(text),
            (None, None) => ShutdownStrategy::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShutdownStrategy::None => "none",
            ShutdownStrategy::Helper(_) => "helper",
            ShutdownStrategy::Text(_) => "text",
        }
    }
}

/// Resolved shutdown settings consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub strategy: ShutdownStrategy,
    /// How long the child may take to exit after the helper/text step.
    pub shutdown_timeout: Duration,
    /// Hard ceiling on the whole shutdown sequence.
    pub absolute_timeout: Duration,
    /// Working directory for the helper.
    pub working_dir: PathBuf,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            strategy: ShutdownStrategy::None,
            shutdown_timeout: Duration::from_secs(30),
            absolute_timeout: Duration::from_secs(60),
            working_dir: PathBuf::from("."),
        }
    }
}

/// Stop-file polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopFileConfig {
    pub path: PathBuf,
    pub poll_interval: Duration,
}

/// Everything the supervisor needs, after merging file config and CLI overrides.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub child: CommandSpec,
    pub working_dir: PathBuf,
    pub shutdown: ShutdownConfig,
    pub stop_file: Option<StopFileConfig>,
    pub status_file: Option<PathBuf>,
}

/// Values from the command line that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub shutdown_command: Option<PathBuf>,
    pub shutdown_text: Option<String>,
    pub shutdown_timeout_secs: Option<u64>,
    pub absolute_timeout_secs: Option<u64>,
    pub stop_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

/// Errors that can occur while loading or resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Neither the command line nor the config file names a child command.
    MissingCommand,
    /// A setting has an unusable value.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::MissingCommand => {
                write!(f, "no child command given (pass it after the options or set [child] command)")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingCommand | ConfigError::Invalid(_) => None,
        }
    }
}

impl WardenConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `path`, falling back to defaults when it is missing and was not
    /// explicitly requested.
    pub fn load_or_default(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Merge CLI overrides into this config. Relative defaults resolve against `cwd`.
    pub fn resolve(self, overrides: CliOverrides, cwd: &Path) -> Result<SupervisorConfig, ConfigError> {
        let child = if overrides.command.is_empty() {
            let program = self.child.command.filter(|c| !c.trim().is_empty());
            match program {
                Some(program) => CommandSpec::new(program, self.child.args),
                None => return Err(ConfigError::MissingCommand),
            }
        } else {
            CommandSpec::from_tokens(&overrides.command).ok_or(ConfigError::MissingCommand)?
        };

        let working_dir = overrides
            .working_dir
            .or(self.child.working_dir)
            .unwrap_or_else(|| cwd.to_path_buf());

        let settings = self.shutdown;
        let helper = match overrides.shutdown_command {
            Some(program) => Some(CommandSpec::new(program, Vec::new())),
            None => settings
                .helper_command
                .map(|program| CommandSpec::new(program, settings.helper_args)),
        };
        let text = overrides.shutdown_text.or(settings.text);

        let timeout_secs = overrides.shutdown_timeout_secs.unwrap_or(settings.timeout_secs);
        let absolute_secs = overrides
            .absolute_timeout_secs
            .unwrap_or(settings.absolute_timeout_secs);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid("shutdown timeout must be greater than zero".into()));
        }
        if absolute_secs == 0 {
            return Err(ConfigError::Invalid("absolute timeout must be greater than zero".into()));
        }
        if absolute_secs < timeout_secs {
            tracing::warn!(
                timeout_secs,
                absolute_secs,
                "absolute timeout is shorter than the shutdown timeout; it will always win"
            );
        }

        let stop_file = match overrides.stop_file.or(settings.stop_file) {
            Some(path) => {
                if settings.stop_poll_millis == 0 {
                    return Err(ConfigError::Invalid("stop_poll_millis must be greater than zero".into()));
                }
                Some(StopFileConfig {
                    path,
                    poll_interval: Duration::from_millis(settings.stop_poll_millis),
                })
            }
            None => None,
        };

        Ok(SupervisorConfig {
            child,
            shutdown: ShutdownConfig {
                strategy: ShutdownStrategy::resolve(helper, text),
                shutdown_timeout: Duration::from_secs(timeout_secs),
                absolute_timeout: Duration::from_secs(absolute_secs),
                working_dir: working_dir.clone(),
            },
            working_dir,
            stop_file,
            status_file: overrides.status_file.or(self.status.file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn with_command(parts: &[&str]) -> CliOverrides {
        CliOverrides {
            command: tokens(parts),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let config = WardenConfig::default();
        assert_eq!(config.shutdown.timeout_secs, 30);
        assert_eq!(config.shutdown.absolute_timeout_secs, 60);
        assert_eq!(config.shutdown.stop_poll_millis, 1000);
        assert!(config.child.command.is_none());
        assert!(config.status.file.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config: WardenConfig = toml::from_str(
            r#"
            [child]
            command = "java"
            args = ["-jar", "server.jar"]
            working_dir = "/srv/mc"

            [shutdown]
            helper_command = "./stop.sh"
            helper_args = ["--now"]
            text = "stop"
            timeout_secs = 10
            absolute_timeout_secs = 20
            stop_file = "STOP"
            stop_poll_millis = 250

            [status]
            file = "warden.status"
            "#,
        )
        .unwrap();
        assert_eq!(config.child.command.as_deref(), Some("java"));
        assert_eq!(config.child.args, vec!["-jar", "server.jar"]);
        assert_eq!(config.child.working_dir, Some(PathBuf::from("/srv/mc")));
        assert_eq!(config.shutdown.helper_command, Some(PathBuf::from("./stop.sh")));
        assert_eq!(config.shutdown.helper_args, vec!["--now"]);
        assert_eq!(config.shutdown.timeout_secs, 10);
        assert_eq!(config.shutdown.absolute_timeout_secs, 20);
        assert_eq!(config.shutdown.stop_poll_millis, 250);
        assert_eq!(config.status.file, Some(PathBuf::from("warden.status")));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: WardenConfig = toml::from_str("[shutdown]\ntext = \"end\"\n").unwrap();
        assert_eq!(config.shutdown.text.as_deref(), Some("end"));
        assert_eq!(config.shutdown.timeout_secs, 30);
        assert_eq!(config.shutdown.absolute_timeout_secs, 60);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[shutdown\ntext = ").unwrap();
        let err = WardenConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_or_default_missing_implicit_file() {
        let config =
            WardenConfig::load_or_default(Path::new("/nonexistent-dir/warden.toml"), false).unwrap();
        assert_eq!(config.shutdown.timeout_secs, 30);
    }

    #[test]
    fn test_load_or_default_missing_explicit_file() {
        let err =
            WardenConfig::load_or_default(Path::new("/nonexistent-dir/warden.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[child]\ncommand = \"cat\"\n").unwrap();
        let config = WardenConfig::load_or_default(&path, false).unwrap();
        assert_eq!(config.child.command.as_deref(), Some("cat"));
    }

    #[test]
    fn test_from_tokens_splits_single_token() {
        let spec = CommandSpec::from_tokens(&tokens(&["java -jar  server.jar"])).unwrap();
        assert_eq!(spec.program, PathBuf::from("java"));
        assert_eq!(spec.args, vec!["-jar", "server.jar"]);
    }

    #[test]
    fn test_from_tokens_keeps_separate_tokens() {
        let spec = CommandSpec::from_tokens(&tokens(&["sh", "-c", "echo hi; exit 2"])).unwrap();
        assert_eq!(spec.program, PathBuf::from("sh"));
        assert_eq!(spec.args, vec!["-c", "echo hi; exit 2"]);
        assert_eq!(spec.to_string(), "sh -c echo hi; exit 2");
    }

    #[test]
    fn test_from_tokens_empty() {
        assert!(CommandSpec::from_tokens(&[]).is_none());
        assert!(CommandSpec::from_tokens(&tokens(&["   "])).is_none());
    }

    #[test]
    fn test_strategy_helper_wins_over_text() {
        let strategy = ShutdownStrategy::resolve(
            Some(CommandSpec::new("./stop.sh", vec![])),
            Some("end".to_string()),
        );
        assert_eq!(strategy, ShutdownStrategy::Helper(CommandSpec::new("./stop.sh", vec![])));
        assert_eq!(strategy.name(), "helper");
    }

    #[test]
    fn test_strategy_blank_values_are_unset() {
        let strategy = ShutdownStrategy::resolve(
            Some(CommandSpec::new("  ", vec![])),
            Some("end".to_string()),
        );
        assert_eq!(strategy, ShutdownStrategy::Text("end".to_string()));

        let strategy = ShutdownStrategy::resolve(None, Some(" \t".to_string()));
        assert_eq!(strategy, ShutdownStrategy::None);
    }

    #[test]
    fn test_strategy_text_is_not_trimmed() {
        let strategy = ShutdownStrategy::resolve(None, Some(" save-all ".to_string()));
        assert_eq!(strategy, ShutdownStrategy::Text(" save-all ".to_string()));
    }

    #[test]
    fn test_resolve_uses_file_values() {
        let config: WardenConfig = toml::from_str(
            r#"
            [child]
            command = "java"
            args = ["-jar", "server.jar"]
            [shutdown]
            text = "end"
            timeout_secs = 5
            "#,
        )
        .unwrap();
        let resolved = config.resolve(CliOverrides::default(), Path::new("/work")).unwrap();
        assert_eq!(resolved.child, CommandSpec::new("java", tokens(&["-jar", "server.jar"])));
        assert_eq!(resolved.working_dir, PathBuf::from("/work"));
        assert_eq!(resolved.shutdown.strategy, ShutdownStrategy::Text("end".to_string()));
        assert_eq!(resolved.shutdown.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(resolved.shutdown.absolute_timeout, Duration::from_secs(60));
        assert_eq!(resolved.shutdown.working_dir, PathBuf::from("/work"));
        assert!(resolved.stop_file.is_none());
        assert!(resolved.status_file.is_none());
    }

    #[test]
    fn test_resolve_cli_overrides_win() {
        let config: WardenConfig = toml::from_str(
            r#"
            [child]
            command = "java"
            working_dir = "/srv"
            [shutdown]
            helper_command = "./stop.sh"
            helper_args = ["--fast"]
            timeout_secs = 5
            stop_file = "STOP"
            "#,
        )
        .unwrap();
        let overrides = CliOverrides {
            command: tokens(&["cat"]),
            working_dir: Some(PathBuf::from("/tmp")),
            shutdown_command: Some(PathBuf::from("/bin/other")),
            shutdown_timeout_secs: Some(7),
            absolute_timeout_secs: Some(9),
            status_file: Some(PathBuf::from("status.json")),
            ..Default::default()
        };
        let resolved = config.resolve(overrides, Path::new("/work")).unwrap();
        assert_eq!(resolved.child, CommandSpec::new("cat", vec![]));
        assert_eq!(resolved.working_dir, PathBuf::from("/tmp"));
        assert_eq!(
            resolved.shutdown.strategy,
            ShutdownStrategy::Helper(CommandSpec::new("/bin/other", vec![]))
        );
        assert_eq!(resolved.shutdown.shutdown_timeout, Duration::from_secs(7));
        assert_eq!(resolved.shutdown.absolute_timeout, Duration::from_secs(9));
        assert_eq!(
            resolved.stop_file,
            Some(StopFileConfig {
                path: PathBuf::from("STOP"),
                poll_interval: Duration::from_millis(1000),
            })
        );
        assert_eq!(resolved.status_file, Some(PathBuf::from("status.json")));
    }

    #[test]
    fn test_resolve_file_helper_keeps_args() {
        let config: WardenConfig = toml::from_str(
            "[shutdown]\nhelper_command = \"./stop.sh\"\nhelper_args = [\"--fast\"]\n",
        )
        .unwrap();
        let resolved = config.resolve(with_command(&["cat"]), Path::new(".")).unwrap();
        assert_eq!(
            resolved.shutdown.strategy,
            ShutdownStrategy::Helper(CommandSpec::new("./stop.sh", tokens(&["--fast"])))
        );
    }

    #[test]
    fn test_resolve_without_command_fails() {
        let err = WardenConfig::default()
            .resolve(CliOverrides::default(), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand));
    }

    #[test]
    fn test_resolve_rejects_zero_timeouts() {
        let overrides = CliOverrides {
            shutdown_timeout_secs: Some(0),
            ..with_command(&["cat"])
        };
        let err = WardenConfig::default().resolve(overrides, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let overrides = CliOverrides {
            absolute_timeout_secs: Some(0),
            ..with_command(&["cat"])
        };
        let err = WardenConfig::default().resolve(overrides, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("absolute timeout"));
    }

    #[test]
    fn test_resolve_defaults_to_no_strategy() {
        let resolved = WardenConfig::default()
            .resolve(with_command(&["cat"]), Path::new("."))
            .unwrap();
        assert_eq!(resolved.shutdown.strategy, ShutdownStrategy::None);
        assert_eq!(resolved.shutdown.strategy.name(), "none");
    }
}
