//! Server catalog model: `ServerDefinition`, the `CatalogLoader` abstraction, and the
//! reference TOML-backed loader.
//!
//! Loading and merging catalogs across external tool ecosystems (Cursor, Claude, Codex,
//! VSCode, Windsurf, ...) is out of scope here — `CatalogLoader` is the seam a richer
//! loader plugs into. `TomlCatalogLoader` is the fixture/reference implementation,
//! grounded on the validation discipline of the teacher's `PorterConfig::validate`.

use crate::error::{HubError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// How a server is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    Stdio {
        executable: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    },
}

/// The only auth scheme this crate concerns itself with: whether a loopback
/// OAuth flow is needed before the server can be called. Token exchange and
/// refresh are the job of an `AuthProvider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    OAuth,
}

/// Whether a server's transport should be torn down after each call (the
/// default) or kept warm by the daemon across invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Transient,
    KeepAlive { idle_timeout_ms: Option<u64> },
}

impl Lifecycle {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Lifecycle::KeepAlive { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub daemon_enabled: bool,
}

/// A fully normalized, immutable description of one managed MCP server.
#[derive(Debug, Clone)]
pub struct ServerDefinition {
    pub name: String,
    pub description: Option<String>,
    pub command: Command,
    pub env: HashMap<String, String>,
    pub auth: Option<AuthKind>,
    pub token_cache_dir: Option<PathBuf>,
    pub client_name: Option<String>,
    pub oauth_redirect_url: Option<String>,
    pub lifecycle: Lifecycle,
    pub logging: LoggingConfig,
    pub source: String,
    pub sources: Vec<String>,
}

impl ServerDefinition {
    pub fn is_http(&self) -> bool {
        matches!(self.command, Command::Http { .. })
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self.command, Command::Stdio { .. })
    }

    /// Directory used for the OAuth token cache and the schema cache file.
    ///
    /// Defaults to `<home>/.mcporter/<name>` when `auth = oauth` and no
    /// explicit `token_cache_dir` was given.
    pub fn effective_token_cache_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.token_cache_dir {
            return Some(dir.clone());
        }
        if self.auth == Some(AuthKind::OAuth) {
            return dirs::home_dir().map(|home| home.join(".mcporter").join(&self.name));
        }
        None
    }
}

/// External collaborator: yields normalized `ServerDefinition`s from some catalog
/// source. Ecosystem-specific merging across tools lives behind this trait, outside
/// this crate.
pub trait CatalogLoader {
    fn load(&self) -> Result<Vec<ServerDefinition>>;
}

// --- Reference TOML loader -------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    servers: HashMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    description: Option<String>,

    #[serde(alias = "base_url", alias = "serverUrl", alias = "server_url")]
    url: Option<String>,
    #[serde(alias = "bearer_token")]
    bearer_token: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,

    command: Option<RawCommand>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,

    #[serde(default)]
    env: HashMap<String, String>,

    auth: Option<String>,
    token_cache_dir: Option<PathBuf>,
    client_name: Option<String>,
    oauth_redirect_url: Option<String>,

    #[serde(default)]
    lifecycle: Option<String>,
    idle_timeout_ms: Option<u64>,

    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    #[serde(default)]
    daemon: RawDaemonLogging,
}

#[derive(Debug, Default, Deserialize)]
struct RawDaemonLogging {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Words(String),
    Argv(Vec<String>),
}

pub struct TomlCatalogLoader {
    path: PathBuf,
}

impl TomlCatalogLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogLoader for TomlCatalogLoader {
    fn load(&self) -> Result<Vec<ServerDefinition>> {
        let text = std::fs::read_to_string(&self.path)?;
        let raw: RawCatalog = toml::from_str(&text)
            .map_err(|e| HubError::RuntimeError(format!("invalid catalog TOML: {e}")))?;
        let source = self.path.display().to_string();

        let mut out = Vec::with_capacity(raw.servers.len());
        for (name, entry) in raw.servers {
            out.push(normalize_entry(name, entry, source.clone())?);
        }
        Ok(out)
    }
}

fn normalize_entry(name: String, entry: RawEntry, source: String) -> Result<ServerDefinition> {
    let has_url = entry.url.is_some();
    let has_command = entry.command.is_some();
    if has_url == has_command {
        return Err(HubError::MissingCommandOrUrl(name));
    }

    let command = if let Some(url) = entry.url {
        let mut headers = entry.headers;
        if let Some(token) = entry.bearer_token {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        ensure_http_accept_header(&mut headers);
        Command::Http { url, headers }
    } else {
        let (executable, mut args) = match entry.command.unwrap() {
            RawCommand::Words(s) => split_command_words(&s)?,
            RawCommand::Argv(argv) => {
                let mut iter = argv.into_iter();
                let executable = iter
                    .next()
                    .ok_or_else(|| HubError::MissingCommandOrUrl(name.clone()))?;
                (executable, iter.collect())
            }
        };
        args.extend(entry.args);
        Command::Stdio {
            executable,
            args,
            cwd: entry.cwd,
        }
    };

    let auth = match entry.auth.as_deref() {
        Some("oauth") => Some(AuthKind::OAuth),
        Some(other) => {
            return Err(HubError::RuntimeError(format!(
                "server '{name}': unsupported auth scheme '{other}'"
            )))
        }
        None => None,
    };

    let lifecycle = match entry.lifecycle.as_deref() {
        None | Some("transient") => Lifecycle::Transient,
        Some("keep-alive") => Lifecycle::KeepAlive {
            idle_timeout_ms: entry.idle_timeout_ms,
        },
        Some(other) => {
            return Err(HubError::RuntimeError(format!(
                "server '{name}': unknown lifecycle '{other}'"
            )))
        }
    };

    Ok(ServerDefinition {
        name: name.clone(),
        description: entry.description,
        command,
        env: entry.env,
        auth,
        token_cache_dir: entry.token_cache_dir,
        client_name: entry.client_name,
        oauth_redirect_url: entry.oauth_redirect_url,
        lifecycle,
        logging: LoggingConfig {
            daemon_enabled: entry.logging.daemon.enabled,
        },
        source: source.clone(),
        sources: vec![source],
    })
}

/// Split a shell-like command string into `(executable, args)` honoring single
/// and double quotes and backslash escapes, without invoking a shell.
fn split_command_words(s: &str) -> Result<(String, Vec<String>)> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(&next) = chars.peek() {
                    if next == '"' || next == '\\' {
                        current.push(chars.next().unwrap());
                        continue;
                    }
                }
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word || !current.is_empty() {
        words.push(current);
    }

    let mut iter = words.into_iter();
    let executable = iter
        .next()
        .ok_or_else(|| HubError::RuntimeError("empty command string".to_string()))?;
    Ok((executable, iter.collect()))
}

/// Normalize a header map's `Accept` entry so it carries both tokens MCP's
/// streaming HTTP transport requires, preserving a caller-supplied value only
/// if it already satisfies that requirement.
pub fn ensure_http_accept_header(headers: &mut HashMap<String, String>) {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case("accept"))
        .cloned();

    if let Some(key) = &key {
        let value = &headers[key];
        let lower = value.to_ascii_lowercase();
        if lower.contains("application/json") && lower.contains("text/event-stream") {
            return;
        }
    }

    let normalized = "application/json, text/event-stream".to_string();
    match key {
        Some(key) => {
            headers.insert(key, normalized);
        }
        None => {
            headers.insert("Accept".to_string(), normalized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_overwritten_when_absent() {
        let mut headers = HashMap::new();
        ensure_http_accept_header(&mut headers);
        assert_eq!(headers["Accept"], "application/json, text/event-stream");
    }

    #[test]
    fn accept_header_overwritten_when_incomplete() {
        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        ensure_http_accept_header(&mut headers);
        assert_eq!(headers["Accept"], "application/json, text/event-stream");
    }

    #[test]
    fn accept_header_preserved_when_already_complete() {
        let mut headers = HashMap::new();
        headers.insert(
            "accept".to_string(),
            "text/event-stream, application/json; charset=utf-8".to_string(),
        );
        ensure_http_accept_header(&mut headers);
        assert_eq!(
            headers["accept"],
            "text/event-stream, application/json; charset=utf-8"
        );
    }

    #[test]
    fn split_command_words_handles_quotes() {
        let (exe, args) = split_command_words(r#"docker run --rm "my image" 'a b'"#).unwrap();
        assert_eq!(exe, "docker");
        assert_eq!(args, vec!["run", "--rm", "my image", "a b"]);
    }

    #[test]
    fn normalize_rejects_both_command_and_url() {
        let toml = r#"
            [servers.bad]
            url = "https://example.com/mcp"
            command = "echo hi"
        "#;
        let raw: RawCatalog = toml::from_str(toml).unwrap();
        let (name, entry) = raw.servers.into_iter().next().unwrap();
        let err = normalize_entry(name, entry, "test".into()).unwrap_err();
        assert!(matches!(err, HubError::MissingCommandOrUrl(_)));
    }

    #[test]
    fn normalize_rejects_neither_command_nor_url() {
        let toml = r#"
            [servers.bad]
            description = "no transport"
        "#;
        let raw: RawCatalog = toml::from_str(toml).unwrap();
        let (name, entry) = raw.servers.into_iter().next().unwrap();
        let err = normalize_entry(name, entry, "test".into()).unwrap_err();
        assert!(matches!(err, HubError::MissingCommandOrUrl(_)));
    }

    #[test]
    fn bearer_token_becomes_authorization_header() {
        let toml = r#"
            [servers.api]
            url = "https://api.example.com/mcp"
            bearer_token = "secret123"
        "#;
        let raw: RawCatalog = toml::from_str(toml).unwrap();
        let (name, entry) = raw.servers.into_iter().next().unwrap();
        let def = normalize_entry(name, entry, "test".into()).unwrap();
        match def.command {
            Command::Http { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer secret123");
                assert_eq!(headers["Accept"], "application/json, text/event-stream");
            }
            _ => panic!("expected http command"),
        }
    }

    #[test]
    fn keep_alive_lifecycle_parses_idle_timeout() {
        let toml = r#"
            [servers.warm]
            command = "warm-server"
            lifecycle = "keep-alive"
            idle_timeout_ms = 5000
        "#;
        let raw: RawCatalog = toml::from_str(toml).unwrap();
        let (name, entry) = raw.servers.into_iter().next().unwrap();
        let def = normalize_entry(name, entry, "test".into()).unwrap();
        assert_eq!(
            def.lifecycle,
            Lifecycle::KeepAlive {
                idle_timeout_ms: Some(5000)
            }
        );
    }

    #[test]
    fn oauth_without_explicit_cache_dir_defaults_under_home() {
        let def = ServerDefinition {
            name: "gh".into(),
            description: None,
            command: Command::Http {
                url: "https://example.com".into(),
                headers: HashMap::new(),
            },
            env: HashMap::new(),
            auth: Some(AuthKind::OAuth),
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            lifecycle: Lifecycle::Transient,
            logging: LoggingConfig::default(),
            source: "test".into(),
            sources: vec!["test".into()],
        };
        let dir = def.effective_token_cache_dir().unwrap();
        assert!(dir.ends_with(".mcporter/gh"));
    }
}
