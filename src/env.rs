//! `.env` file support.
//!
//! Two files are read from one directory: `.env.local` replaces variables the process
//! already has, `.env` only fills the gaps. Values are applied before the CLI is parsed, so
//! every `env = "..."` fallback sees them.

use std::collections::BTreeMap;
use std::path::Path;

use crate::gateway::ConfigError;

pub const LOCAL_DOTENV: &str = ".env.local";
pub const SHARED_DOTENV: &str = ".env";

#[derive(Clone, Default)]
pub struct Env {
    overriding: BTreeMap<String, String>,
    fallback: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("local_keys", &self.overriding.keys().collect::<Vec<_>>())
            .field("shared_keys", &self.fallback.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Env {
    pub fn from_contents(local: &str, shared: &str) -> Self {
        Self {
            overriding: parse_dotenv(local),
            fallback: parse_dotenv(shared),
        }
    }

    /// Reads `.env.local` and `.env` under `dir`. Missing files count as empty.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let local = read_optional(&dir.join(LOCAL_DOTENV))?;
        let shared = read_optional(&dir.join(SHARED_DOTENV))?;
        Ok(Self::from_contents(&local, &shared))
    }

    pub fn is_empty(&self) -> bool {
        self.overriding.is_empty() && self.fallback.is_empty()
    }

    /// The value `apply` would leave in the environment for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overriding.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.fallback.get(key).cloned())
    }

    /// Exports the parsed values into the process environment.
    ///
    /// Must run before any other thread is spawned (i.e. before the tokio runtime starts).
    pub fn apply(&self) {
        let unset_fallbacks = self
            .fallback
            .iter()
            .filter(|(key, _)| !self.overriding.contains_key(*key))
            .filter(|(key, _)| std::env::var_os(key).is_none());
        for (key, value) in self.overriding.iter().chain(unset_fallbacks) {
            // SAFETY: called from `main` before the runtime and any worker threads exist.
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn read_optional(path: &Path) -> Result<String, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// `KEY=value` lines; `export` prefixes, comments and surrounding quotes are accepted.
/// Blank values are skipped so they never shadow a real setting.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = unquote(value.trim());
    if key.is_empty() || key.contains(char::is_whitespace) || value.trim().is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
