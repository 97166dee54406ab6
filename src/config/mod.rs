//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`AGENTRELAY_BACKEND_BIN`,
//!    `AGENTRELAY_APPROVAL_POLICY`, `AGENTRELAY_MACHINE`, `AGENTRELAY_STATE_PATH`)
//! 2. TOML file specified via --config CLI flag
//! 3. ./agentrelay.toml in the current directory
//! 4. $XDG_CONFIG_HOME/agentrelay/agentrelay.toml (or ~/.config/agentrelay/agentrelay.toml)
//! 5. Built-in defaults

use crate::error::ConfigError;
use crate::machine::MachineKind;
use std::path::{Path, PathBuf};

mod defaults;
mod types;

pub use defaults::KNOWN_APPROVAL_POLICIES;
pub use types::{
    ApprovalMode, ApprovalsConfig, BackendConfig, BackendDialect, Config, LivenessConfig,
    MachineDef, MachinesConfig, OutputConfig, StateConfig,
};

const CONFIG_FILE_NAME: &str = "agentrelay.toml";
const CONFIG_DIR_NAME: &str = "agentrelay";

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from --config flag).
pub fn load_config(path_override: Option<&str>) -> Result<Config, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        dirs::config_dir,
    )
}

fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<Config, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let text = read_config_text(path_override, &read_file, &config_root)?;
    let mut config: Config = toml::from_str(&text)?;
    apply_env_overrides(&mut config, &env_lookup);
    validate(&config)?;
    Ok(config)
}

fn read_config_text<FRead, FRoot>(
    path_override: Option<&str>,
    read_file: &FRead,
    config_root: &FRoot,
) -> Result<String, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FRoot: Fn() -> Option<PathBuf>,
{
    // An explicit path must exist; implicit locations are optional.
    if let Some(p) = path_override {
        return Ok(read_file(Path::new(p))?);
    }
    if let Ok(text) = read_file(Path::new(CONFIG_FILE_NAME)) {
        return Ok(text);
    }
    if let Some(dir) = config_root() {
        if let Ok(text) = read_file(&dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)) {
            return Ok(text);
        }
    }
    Ok(String::new())
}

fn apply_env_overrides<FEnv>(config: &mut Config, env_lookup: &FEnv)
where
    FEnv: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| env_lookup(name).filter(|v| !v.trim().is_empty());
    if let Some(bin) = non_empty("AGENTRELAY_BACKEND_BIN") {
        config.backend.bin = bin;
    }
    if let Some(policy) = non_empty("AGENTRELAY_APPROVAL_POLICY") {
        config.backend.approval_policy = policy.trim().to_string();
    }
    if let Some(machine) = non_empty("AGENTRELAY_MACHINE") {
        config.machines.default = machine.trim().to_string();
    }
    if let Some(path) = non_empty("AGENTRELAY_STATE_PATH") {
        config.state.path = Some(path);
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if !KNOWN_APPROVAL_POLICIES.contains(&config.backend.approval_policy.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "backend.approval_policy `{}` must be one of: {}",
            config.backend.approval_policy,
            KNOWN_APPROVAL_POLICIES.join(", ")
        )));
    }
    if config.approvals.prefix_tokens == 0 {
        return Err(ConfigError::Invalid(
            "approvals.prefix_tokens must be at least 1".into(),
        ));
    }
    if config.backend.bin.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.bin must not be empty".into()));
    }
    for (name, def) in &config.machines.defs {
        if def.kind != MachineKind::Ssh {
            continue;
        }
        let missing = |field: &Option<String>| field.as_deref().map_or(true, |v| v.trim().is_empty());
        if missing(&def.host) || missing(&def.user) {
            return Err(ConfigError::Invalid(format!(
                "ssh machine `{name}` requires host and user"
            )));
        }
    }
    if !config.machines.defs.contains_key(&config.machines.default) {
        return Err(ConfigError::Invalid(format!(
            "machines.default `{}` is not defined under [machines.defs]",
            config.machines.default
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_with(
        path_override: Option<&str>,
        files: &[(&str, &str)],
        env: &[(&str, &str)],
    ) -> Result<Config, ConfigError> {
        let files: HashMap<PathBuf, String> = files
            .iter()
            .map(|(p, t)| (PathBuf::from(p), t.to_string()))
            .collect();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from_sources(
            path_override,
            |path| {
                files.get(path).cloned().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "missing")
                })
            },
            |name| env.get(name).cloned(),
            || Some(PathBuf::from("/xdg")),
        )
    }

    // Ensures an empty environment yields the built-in defaults.
    #[test]
    fn defaults_when_no_files_exist() {
        let config = load_with(None, &[], &[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backend.approval_policy, "untrusted");
        assert_eq!(config.approvals.prefix_tokens, 2);
        assert_eq!(config.liveness.first_event_timeout_ms, 15_000);
        assert_eq!(config.machines.default, "local");
    }

    // Ensures the local file wins over the XDG location.
    #[test]
    fn local_file_precedes_global_file() {
        let config = load_with(
            None,
            &[
                ("agentrelay.toml", "[backend]\nbin = \"local-codex\"\n"),
                (
                    "/xdg/agentrelay/agentrelay.toml",
                    "[backend]\nbin = \"global-codex\"\n",
                ),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(config.backend.bin, "local-codex");
    }

    // Ensures the XDG file is used when no local file exists.
    #[test]
    fn global_file_is_used_as_fallback() {
        let config = load_with(
            None,
            &[(
                "/xdg/agentrelay/agentrelay.toml",
                "[approvals]\nprefix_tokens = 3\n",
            )],
            &[],
        )
        .unwrap();
        assert_eq!(config.approvals.prefix_tokens, 3);
    }

    // Ensures a missing explicit config path is an error, not a silent default.
    #[test]
    fn explicit_path_must_exist() {
        let err = load_with(Some("/nope.toml"), &[], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    // Ensures environment overrides are applied after file parsing.
    #[test]
    fn env_overrides_file_values() {
        let config = load_with(
            Some("custom.toml"),
            &[(
                "custom.toml",
                "[backend]\napproval_policy = \"never\"\n",
            )],
            &[
                ("AGENTRELAY_APPROVAL_POLICY", "on-request"),
                ("AGENTRELAY_BACKEND_BIN", "/opt/codex"),
            ],
        )
        .unwrap();
        assert_eq!(config.backend.approval_policy, "on-request");
        assert_eq!(config.backend.bin, "/opt/codex");
    }

    // Ensures ssh machines parse with their connection fields.
    #[test]
    fn parses_ssh_machine_definitions() {
        let toml = r#"
[machines]
default = "build"

[machines.defs.build]
type = "ssh"
host = "build.example.com"
user = "dev"
port = 2200
default_workdir = "~/src"
allowed_roots = ["~/src", "/srv"]
backend_bin = "/home/dev/.local/bin/codex"
"#;
        let config = load_with(Some("c.toml"), &[("c.toml", toml)], &[]).unwrap();
        let def = &config.machines.defs["build"];
        assert_eq!(def.kind, MachineKind::Ssh);
        assert_eq!(def.port, 2200);
        assert!(def.use_agent);
        assert_eq!(def.effective_allowed_roots(), vec!["~/src", "/srv"]);
        assert_eq!(config.machines.default, "build");
    }

    // Ensures invalid policy strings are rejected at load time.
    #[test]
    fn rejects_unknown_approval_policy() {
        let err = load_with(None, &[], &[("AGENTRELAY_APPROVAL_POLICY", "sometimes")])
            .unwrap_err();
        assert!(err.to_string().contains("approval_policy"), "got: {err}");
    }

    // Ensures ssh machines without host/user are rejected.
    #[test]
    fn rejects_incomplete_ssh_machine() {
        let toml = "[machines.defs.remote]\ntype = \"ssh\"\nhost = \"h\"\n";
        let err = load_with(Some("c.toml"), &[("c.toml", toml)], &[]).unwrap_err();
        assert!(err.to_string().contains("requires host and user"), "got: {err}");
    }

    // Ensures the default machine must exist.
    #[test]
    fn rejects_unknown_default_machine() {
        let err = load_with(None, &[], &[("AGENTRELAY_MACHINE", "ghost")]).unwrap_err();
        assert!(err.to_string().contains("ghost"), "got: {err}");
    }

    #[test]
    fn rejects_zero_prefix_tokens() {
        let toml = "[approvals]\nprefix_tokens = 0\n";
        assert!(load_with(Some("c.toml"), &[("c.toml", toml)], &[]).is_err());
    }
}
