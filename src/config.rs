//! Runtime settings and provider table.
//!
//! `Settings` is built once (normally from the process environment plus an
//! optional `.env` file) and is immutable afterwards. It is the only place
//! raw configuration is read; the manager only ever sees resolved
//! `ProviderSpec`s.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::connection::Timeouts;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{ProviderSpec, TransportKind};

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_WEATHER_PORT: u16 = 8000;
pub const DEFAULT_MATH_PORT: u16 = 8001;

/// Credential the source-control provider needs.
pub const GITHUB_TOKEN_VAR: &str = "GITHUB_PERSONAL_ACCESS_TOKEN";

/// Env var naming an optional JSON providers file.
pub const PROVIDERS_FILE_VAR: &str = "TOOLBRIDGE_PROVIDERS_FILE";

// ─── Provider Entries ────────────────────────────────────────────────────────

/// One provider as configured, before credential resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderEntry {
    pub transport: TransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variables that must be set (and non-empty) for the provider to be used.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl ProviderEntry {
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Sse,
            url: Some(url.into()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            requires: Vec::new(),
        }
    }

    pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            transport: TransportKind::Stdio,
            url: None,
            command: Some(command.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            requires: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn requiring(mut self, var: &str) -> Self {
        self.requires.push(var.to_string());
        self
    }

    fn validate(&self, name: &str) -> Result<(), McpError> {
        let missing = match self.transport {
            TransportKind::Sse if self.url.as_deref().map_or(true, str::is_empty) => "url",
            TransportKind::Stdio if self.command.as_deref().map_or(true, str::is_empty) => {
                "command"
            }
            _ => return Ok(()),
        };
        Err(McpError::Config {
            reason: format!(
                "provider '{name}' uses {} transport but has no {missing}",
                self.transport
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderEntry>,
}

/// Outcome of resolving a provider name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResolution {
    Ready(ProviderSpec),
    /// Configured, but the named credential is absent.
    MissingCredential(String),
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    host: String,
    math_port: u16,
    weather_port: u16,
    timeouts: Timeouts,
    providers: Vec<(String, ProviderEntry)>,
    vars: HashMap<String, String>,
}

impl Settings {
    /// Load `.env` (if any), then read the process environment.
    pub fn from_env() -> Result<Self, McpError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env"),
        }
        Self::from_vars(std::env::vars().collect())
    }

    /// Build settings from an explicit variable snapshot.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, McpError> {
        let host = non_empty(&vars, "IP_HOST").unwrap_or(DEFAULT_HOST).to_string();
        let math_port = parse_var(&vars, "MATH_PORT", DEFAULT_MATH_PORT)?;
        let weather_port = parse_var(&vars, "WEATHER_PORT", DEFAULT_WEATHER_PORT)?;

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            handshake: parse_secs(&vars, "TOOLBRIDGE_HANDSHAKE_TIMEOUT_SECS", defaults.handshake)?,
            call: parse_secs(&vars, "TOOLBRIDGE_CALL_TIMEOUT_SECS", defaults.call)?,
            shutdown_grace: parse_secs(
                &vars,
                "TOOLBRIDGE_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace,
            )?,
        };

        let mut settings = Self {
            host,
            math_port,
            weather_port,
            timeouts,
            providers: Vec::new(),
            vars,
        };
        settings.providers = settings.builtin_providers();

        if let Some(path) = non_empty(&settings.vars, PROVIDERS_FILE_VAR) {
            let path = expand_tilde(path);
            for (name, entry) in load_providers_file(Path::new(&path), &settings.vars)? {
                settings = settings.with_provider(&name, entry);
            }
        }

        Ok(settings)
    }

    /// Add a provider, replacing any existing entry of the same name in place.
    pub fn with_provider(mut self, name: &str, entry: ProviderEntry) -> Self {
        match self.providers.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = entry,
            None => self.providers.push((name.to_string(), entry)),
        }
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn math_port(&self) -> u16 {
        self.math_port
    }

    pub fn weather_port(&self) -> u16 {
        self.weather_port
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.timeouts.handshake
    }

    pub fn call_timeout(&self) -> Duration {
        self.timeouts.call
    }

    /// Wait between SIGTERM and SIGKILL for subprocess providers.
    pub fn shutdown_grace(&self) -> Duration {
        self.timeouts.shutdown_grace
    }

    /// Configured provider names in declaration order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Turn a provider name into a `ProviderSpec`.
    ///
    /// Unknown names are an error; a missing credential is not, so the
    /// manager can drop that provider and carry on.
    pub fn resolve_provider(&self, name: &str) -> Result<ProviderResolution, McpError> {
        let (_, entry) = self
            .providers
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| McpError::UnknownProvider {
                name: name.to_string(),
            })?;

        if let Some(var) = entry.requires.iter().find(|v| non_empty(&self.vars, v).is_none()) {
            return Ok(ProviderResolution::MissingCredential(var.clone()));
        }

        let spec = match entry.transport {
            TransportKind::Sse => ProviderSpec::sse(name, entry.url.as_deref().unwrap_or_default()),
            TransportKind::Stdio => ProviderSpec::stdio(
                name,
                entry.command.as_deref().unwrap_or_default(),
                entry.args.clone(),
            ),
        };
        let spec = entry
            .env
            .iter()
            .fold(spec, |spec, (k, v)| spec.with_env(k, v));

        Ok(ProviderResolution::Ready(spec))
    }

    fn builtin_providers(&self) -> Vec<(String, ProviderEntry)> {
        let token = non_empty(&self.vars, GITHUB_TOKEN_VAR).unwrap_or_default();
        vec![
            (
                "math".to_string(),
                ProviderEntry::sse(format!("http://{}:{}/sse", self.host, self.math_port)),
            ),
            (
                "weather".to_string(),
                ProviderEntry::sse(format!("http://{}:{}/sse", self.host, self.weather_port)),
            ),
            (
                "sourcecontrol".to_string(),
                ProviderEntry::stdio(
                    "docker",
                    &["run", "--rm", "-i", "-e", GITHUB_TOKEN_VAR, "mcp/github"],
                )
                .with_env(GITHUB_TOKEN_VAR, token)
                .requiring(GITHUB_TOKEN_VAR),
            ),
        ]
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, McpError> {
    match non_empty(vars, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| McpError::Config {
            reason: format!("{key} must be a number, got '{raw}'"),
        }),
    }
}

fn parse_secs(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, McpError> {
    match non_empty(vars, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| McpError::Config {
                reason: format!("{key} must be a positive number of seconds, got '{raw}'"),
            }),
    }
}

// ─── Providers File ──────────────────────────────────────────────────────────

fn load_providers_file(
    path: &Path,
    vars: &HashMap<String, String>,
) -> Result<BTreeMap<String, ProviderEntry>, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read providers file {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw, vars);

    let file: ProvidersFile = serde_json::from_str(&interpolated).map_err(|e| McpError::Config {
        reason: format!("failed to parse providers file {}: {e}", path.display()),
    })?;

    for (name, entry) in &file.providers {
        entry.validate(name)?;
    }

    tracing::debug!(
        path = %path.display(),
        providers = file.providers.len(),
        "loaded providers file"
    );
    Ok(file.providers)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str, vars: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr, vars));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default` against the snapshot.
fn resolve_var_expr(expr: &str, vars: &HashMap<String, String>) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => non_empty(vars, name)
            .map(str::to_string)
            .unwrap_or_else(|| expand_tilde(default)),
        None => vars.get(expr).cloned().unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ready(settings: &Settings, name: &str) -> ProviderSpec {
        match settings.resolve_provider(name).unwrap() {
            ProviderResolution::Ready(spec) => spec,
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_vars(HashMap::new()).unwrap();
        assert_eq!(settings.host(), "localhost");
        assert_eq!(settings.math_port(), 8001);
        assert_eq!(settings.weather_port(), 8000);
        assert_eq!(settings.timeouts(), Timeouts::default());
        assert_eq!(settings.provider_names(), vec!["math", "weather", "sourcecontrol"]);
    }

    #[test]
    fn test_builtin_urls_follow_host_and_ports() {
        let settings =
            Settings::from_vars(vars(&[("IP_HOST", "10.0.0.5"), ("MATH_PORT", "9001")])).unwrap();
        assert_eq!(ready(&settings, "math").target, "http://10.0.0.5:9001/sse");
        assert_eq!(ready(&settings, "weather").target, "http://10.0.0.5:8000/sse");
    }

    #[test]
    fn test_bad_port_is_config_error() {
        let err = Settings::from_vars(vars(&[("MATH_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
        assert!(err.to_string().contains("MATH_PORT"));
    }

    #[test]
    fn test_timeouts_from_vars() {
        let settings = Settings::from_vars(vars(&[
            ("TOOLBRIDGE_CALL_TIMEOUT_SECS", "2.5"),
            ("TOOLBRIDGE_SHUTDOWN_GRACE_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(settings.timeouts().call, Duration::from_millis(2500));
        assert_eq!(settings.timeouts().shutdown_grace, Duration::from_secs(1));

        let err = Settings::from_vars(vars(&[("TOOLBRIDGE_CALL_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_unknown_provider() {
        let settings = Settings::from_vars(HashMap::new()).unwrap();
        let err = settings.resolve_provider("calendar").unwrap_err();
        assert!(matches!(err, McpError::UnknownProvider { ref name } if name == "calendar"));
    }

    #[test]
    fn test_sourcecontrol_requires_token() {
        let settings = Settings::from_vars(HashMap::new()).unwrap();
        assert_eq!(
            settings.resolve_provider("sourcecontrol").unwrap(),
            ProviderResolution::MissingCredential(GITHUB_TOKEN_VAR.to_string())
        );

        let settings = Settings::from_vars(vars(&[(GITHUB_TOKEN_VAR, "  ")])).unwrap();
        assert!(matches!(
            settings.resolve_provider("sourcecontrol").unwrap(),
            ProviderResolution::MissingCredential(_)
        ));
    }

    #[test]
    fn test_sourcecontrol_with_token_is_docker_subprocess() {
        let settings = Settings::from_vars(vars(&[(GITHUB_TOKEN_VAR, "ghp_abc")])).unwrap();
        let spec = ready(&settings, "sourcecontrol");
        assert_eq!(spec.transport, TransportKind::Stdio);
        assert_eq!(spec.target, "docker");
        assert_eq!(
            spec.args,
            vec!["run", "--rm", "-i", "-e", GITHUB_TOKEN_VAR, "mcp/github"]
        );
        assert_eq!(spec.env.get(GITHUB_TOKEN_VAR).map(String::as_str), Some("ghp_abc"));
    }

    #[test]
    fn test_with_provider_replaces_in_place() {
        let settings = Settings::from_vars(HashMap::new())
            .unwrap()
            .with_provider("math", ProviderEntry::sse("http://127.0.0.1:5555/sse"))
            .with_provider("echo", ProviderEntry::stdio("cat", &[]));
        assert_eq!(
            settings.provider_names(),
            vec!["math", "weather", "sourcecontrol", "echo"]
        );
        assert_eq!(ready(&settings, "math").target, "http://127.0.0.1:5555/sse");
    }

    #[test]
    fn test_providers_file_with_interpolation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{
                "providers": {
                    "weather": {"transport": "sse", "url": "http://${WX_HOST:-wx.internal}:7000/sse"},
                    "notes": {
                        "transport": "stdio",
                        "command": "notes-mcp",
                        "args": ["--db", "${NOTES_DB}"],
                        "env": {"NOTES_TOKEN": "${NOTES_TOKEN}"},
                        "requires": ["NOTES_TOKEN"]
                    }
                }
            }"#,
        )
        .unwrap();

        let settings = Settings::from_vars(vars(&[
            (PROVIDERS_FILE_VAR, path.to_str().unwrap()),
            ("NOTES_DB", "/tmp/notes.db"),
        ]))
        .unwrap();

        assert_eq!(ready(&settings, "weather").target, "http://wx.internal:7000/sse");
        assert_eq!(
            settings.resolve_provider("notes").unwrap(),
            ProviderResolution::MissingCredential("NOTES_TOKEN".into())
        );
        assert_eq!(
            settings.provider_names(),
            vec!["math", "weather", "sourcecontrol", "notes"]
        );
    }

    #[test]
    fn test_providers_file_entry_without_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, r#"{"providers": {"math": {"transport": "sse"}}}"#).unwrap();

        let err =
            Settings::from_vars(vars(&[(PROVIDERS_FILE_VAR, path.to_str().unwrap())])).unwrap_err();
        assert!(err.to_string().contains("has no url"), "{err}");
    }

    #[test]
    fn test_interpolate_env_vars() {
        let snapshot = vars(&[("SET", "value")]);
        assert_eq!(interpolate_env_vars("a ${SET} b", &snapshot), "a value b");
        assert_eq!(interpolate_env_vars("${UNSET:-fallback}", &snapshot), "fallback");
        assert_eq!(interpolate_env_vars("${UNSET}", &snapshot), "");
        assert_eq!(interpolate_env_vars("plain $text", &snapshot), "plain $text");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/providers.json");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/providers.json"));
    }
}
