//! TOML config loading for the coqide CLI.
//!
//! Deserializes `configs/coqtop.toml`, which has a `[coqtop]` section and an
//! optional `[display]` section, then merges with CLI overrides.

use std::path::{Path, PathBuf};

use coqtop::{discover_coqbin, CoqTopSettings};
use serde::Deserialize;

/// Top-level structure matching `configs/coqtop.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct CoqideToml {
    /// Session settings; every field has a default.
    #[serde(default)]
    pub coqtop: CoqTopSettings,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayConfig {
    /// `Printing Width` to set after init.
    pub columns: Option<u32>,
}

/// Command-line flags that feed into the session settings.
#[derive(Debug, Default, Clone)]
pub struct SettingsArgs {
    pub config: Option<PathBuf>,
    pub coq_path: Option<PathBuf>,
    pub wrapper: Option<PathBuf>,
    pub columns: Option<u32>,
}

/// Resolved configuration for one CLI run.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub settings: CoqTopSettings,
    pub columns: Option<u32>,
}

/// Load and deserialize a `CoqideToml` from a TOML file.
pub fn load_coqide_toml(path: &Path) -> anyhow::Result<CoqideToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read config {}: {e}", path.display()))?;
    let config: CoqideToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded coqtop config");
    Ok(config)
}

/// Build the session settings from the TOML file, CLI flags and discovery.
///
/// Priority chain: defaults < TOML values < CLI flags. If no `coq_path` is
/// set anywhere, coqtop is located via `COQBIN` or `PATH`.
pub fn resolve(args: &SettingsArgs) -> anyhow::Result<ResolvedConfig> {
    let toml = match &args.config {
        Some(path) => load_coqide_toml(path)?,
        None => CoqideToml::default(),
    };
    let mut resolved = apply_overrides(toml, args);

    if resolved.settings.coq_path.as_os_str().is_empty() {
        resolved.settings.coq_path = discover_coqbin().ok_or_else(|| {
            anyhow::anyhow!("coqtop not found: set COQBIN, put coqtop on PATH, or pass --coq-path")
        })?;
    }
    tracing::debug!(coqtop = %resolved.settings.coqtop_binary().display(), "Resolved coqtop");
    Ok(resolved)
}

fn apply_overrides(toml: CoqideToml, args: &SettingsArgs) -> ResolvedConfig {
    let mut settings = toml.coqtop;
    if let Some(path) = &args.coq_path {
        settings.coq_path = path.clone();
    }
    if let Some(wrapper) = &args.wrapper {
        settings.wrapper = Some(wrapper.clone());
    }
    ResolvedConfig {
        settings,
        columns: args.columns.or(toml.display.columns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_deserialize_full_toml() {
        let toml_str = r#"
[coqtop]
coq_path = "/opt/coq/bin"
wrapper = "/opt/coq/bin/coqtop-wrapper"
args = ["-R", ".", "Top"]
host = "localhost"
init_timeout_ms = 5000
quit_timeout_ms = 500
call_timeout_ms = 60000

[display]
columns = 100
"#;
        let config: CoqideToml = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coqtop.coq_path, PathBuf::from("/opt/coq/bin"));
        assert_eq!(config.coqtop.args, vec!["-R", ".", "Top"]);
        assert_eq!(config.coqtop.host, "localhost");
        assert_eq!(config.coqtop.init_timeout_ms, 5000);
        assert_eq!(config.coqtop.quit_timeout_ms, 500);
        assert_eq!(config.coqtop.call_timeout_ms, Some(60000));
        assert_eq!(config.display.columns, Some(100));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: CoqideToml = toml::from_str("").unwrap();
        assert!(config.coqtop.coq_path.as_os_str().is_empty());
        assert_eq!(config.coqtop.init_timeout_ms, 3000);
        assert!(config.display.columns.is_none());

        let partial: CoqideToml = toml::from_str("[coqtop]\nargs = [\"-noinit\"]\n").unwrap();
        assert_eq!(partial.coqtop.args, vec!["-noinit"]);
        assert_eq!(partial.coqtop.quit_timeout_ms, 1000);
    }

    #[test]
    fn test_cli_override_priority() {
        let toml: CoqideToml = toml::from_str(
            "[coqtop]\ncoq_path = \"/from/toml\"\n[display]\ncolumns = 80\n",
        )
        .unwrap();
        let args = SettingsArgs {
            coq_path: Some(PathBuf::from("/from/cli")),
            wrapper: Some(PathBuf::from("/from/cli/wrapper")),
            columns: Some(120),
            ..SettingsArgs::default()
        };
        let resolved = apply_overrides(toml, &args);
        assert_eq!(resolved.settings.coq_path, PathBuf::from("/from/cli"));
        assert_eq!(
            resolved.settings.wrapper,
            Some(PathBuf::from("/from/cli/wrapper"))
        );
        assert_eq!(resolved.columns, Some(120));
    }

    #[test]
    fn test_resolve_reads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[coqtop]\ncoq_path = \"/opt/coq/bin\"\ninit_timeout_ms = 9000").unwrap();
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            ..SettingsArgs::default()
        };
        let resolved = resolve(&args).unwrap();
        assert_eq!(resolved.settings.coq_path, PathBuf::from("/opt/coq/bin"));
        assert_eq!(resolved.settings.init_timeout_ms, 9000);
    }

    #[test]
    fn test_resolve_rejects_bad_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[coqtop]\ninit_timeout_ms = \"soon\"").unwrap();
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            ..SettingsArgs::default()
        };
        assert!(resolve(&args).is_err());

        let missing = SettingsArgs {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..SettingsArgs::default()
        };
        assert!(resolve(&missing).is_err());
    }
}
