//! Configuration document shape and discovery.
//!
//! The full configuration file: MCP backends plus `execution`, `logging`,
//! and `workflows` sections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dael_types::{DaelError, ErrorCode};
use serde::{Deserialize, Serialize};

use super::interpolation::interpolate_value;

/// How to reach one MCP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Transport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// One configured MCP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpBackend {
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default)]
    pub disabled: bool,
}

impl McpBackend {
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, Transport::Stdio { .. })
    }

    pub fn is_http(&self) -> bool {
        matches!(self.transport, Transport::Http { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSection {
    #[serde(default)]
    pub servers: HashMap<String, McpBackend>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    10
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowsSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub hot_reload: bool,
}

/// The full configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaelConfig {
    #[serde(default)]
    pub mcp: Option<McpSection>,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub workflows: WorkflowsSection,
}

impl DaelConfig {
    pub fn backends(&self) -> impl Iterator<Item = (&String, &McpBackend)> {
        self.mcp.iter().flat_map(|section| section.servers.iter()).filter(|(_, b)| !b.disabled)
    }
}

/// Parses and interpolates a configuration document from its raw text.
pub fn parse_config(source: &str) -> Result<DaelConfig, DaelError> {
    let mut raw: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| DaelError::new(ErrorCode::ConfigInvalid, format!("invalid configuration YAML: {e}")))?;
    interpolate_value(&mut raw)?;
    serde_yaml::from_value(raw).map_err(|e| DaelError::new(ErrorCode::ConfigInvalid, format!("configuration does not match the expected shape: {e}")))
}

/// Locates the configuration file per the discovery order: an explicit path,
/// the `DAEL_CONFIG` environment variable, `./dael-config.yaml`, then
/// `~/.dael/config.yaml`. Returns `None` if nothing is found, which selects
/// `configuration` mode rather than an error.
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("DAEL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let cwd_candidate = PathBuf::from("dael-config.yaml");
    if cwd_candidate.is_file() {
        return Some(cwd_candidate);
    }
    if let Some(home) = dirs_next::home_dir() {
        let home_candidate = home.join(".dael").join("config.yaml");
        if home_candidate.is_file() {
            return Some(home_candidate);
        }
    }
    None
}

/// Loads configuration per the discovery order. `Ok(None)` means no
/// configuration file was found (`configuration` mode); an invalid file at a
/// discovered path is always a hard error, never treated as "absent".
pub fn load_config(explicit: Option<&Path>) -> Result<Option<DaelConfig>, DaelError> {
    match discover_config_path(explicit) {
        None => Ok(None),
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .map_err(|e| DaelError::new(ErrorCode::ConfigPathInvalid, format!("failed to read configuration file '{}': {e}", path.display())))?;
            parse_config(&source).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_backend() {
        std::env::set_var("DAEL_TEST_TOKEN", "secret-token");
        let source = r#"
mcp:
  servers:
    github:
      transport: stdio
      command: github-mcp-server
      args: ["--stdio"]
      env:
        GITHUB_TOKEN: "${DAEL_TEST_TOKEN}"
"#;
        let config = parse_config(source).unwrap();
        let backend = &config.mcp.unwrap().servers["github"];
        assert!(backend.is_stdio());
        if let Transport::Stdio { env, .. } = &backend.transport {
            assert_eq!(env["GITHUB_TOKEN"], "secret-token");
        } else {
            panic!("expected stdio transport");
        }
        std::env::remove_var("DAEL_TEST_TOKEN");
    }

    #[test]
    fn parses_http_backend_and_defaults_execution_section() {
        let source = r#"
mcp:
  servers:
    remote:
      transport: http
      url: "https://tools.example.com/mcp"
"#;
        let config = parse_config(source).unwrap();
        assert!(config.mcp.unwrap().servers["remote"].is_http());
        assert_eq!(config.execution.max_concurrent, 10);
    }

    #[test]
    fn disabled_backends_are_excluded_from_iteration() {
        let source = r#"
mcp:
  servers:
    a:
      transport: http
      url: "https://a.example.com"
    b:
      transport: http
      url: "https://b.example.com"
      disabled: true
"#;
        let config = parse_config(source).unwrap();
        let names: Vec<&String> = config.backends().map(|(id, _)| id).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn invalid_yaml_is_config_invalid() {
        let error = parse_config("not: [valid: yaml").unwrap_err();
        assert_eq!(error.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn missing_required_env_var_fails_to_parse() {
        std::env::remove_var("DAEL_TEST_ABSENT_TOKEN");
        let source = r#"
mcp:
  servers:
    github:
      transport: stdio
      command: github-mcp-server
      env:
        GITHUB_TOKEN: "${DAEL_TEST_ABSENT_TOKEN}"
"#;
        let error = parse_config(source).unwrap_err();
        assert_eq!(error.code, ErrorCode::ConfigInvalid);
    }
}
