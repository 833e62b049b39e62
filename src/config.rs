//! Runtime configuration.
//!
//! Sources apply in order: built-in defaults, an optional JSON file, then
//! `GARNET_*` environment variables. The CLI applies its own flags last.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compile IR to native code on first invocation.
    pub jit: bool,
    /// Emit guarded fast paths for `+ - * / < <= > >= == != === << [] []= send`.
    pub inline_operators: bool,
    /// Turn direct recursion into a direct call of the enclosing function.
    pub self_call: bool,
    /// Ruby-level call depth at which `SystemStackError` is raised.
    pub max_call_depth: usize,
    /// Stack size in bytes for interpreter threads.
    pub stack_size: usize,
    /// `tracing` filter directive, e.g. `garnet=debug`.
    pub log: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            jit: true,
            inline_operators: true,
            self_call: true,
            max_call_depth: 10_000,
            stack_size: 256 * 1024 * 1024,
            log: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `GARNET_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("GARNET_JIT") {
            self.jit = parse_flag("GARNET_JIT", &v)?;
        }
        if let Some(v) = lookup("GARNET_INLINE") {
            self.inline_operators = parse_flag("GARNET_INLINE", &v)?;
        }
        if let Some(v) = lookup("GARNET_SELF_CALL") {
            self.self_call = parse_flag("GARNET_SELF_CALL", &v)?;
        }
        if let Some(v) = lookup("GARNET_MAX_DEPTH") {
            self.max_call_depth = v
                .parse()
                .map_err(|_| Error::Config(format!("GARNET_MAX_DEPTH: expected a number, got '{v}'")))?;
        }
        if let Some(v) = lookup("GARNET_LOG") {
            self.log = Some(v);
        }
        Ok(())
    }
}

fn parse_flag(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got '{v}'"))),
    }
}

/// Install the global `tracing` subscriber writing to stderr.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(filter: Option<&str>) {
    use std::io::IsTerminal;
    use tracing_subscriber::EnvFilter;

    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_enable_everything() {
        let c = Config::default();
        assert!(c.jit && c.inline_operators && c.self_call);
        assert_eq!(c.max_call_depth, 10_000);
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(env(&[("GARNET_JIT", "0"), ("GARNET_MAX_DEPTH", "50"), ("GARNET_LOG", "debug")]))
            .unwrap();
        assert!(!c.jit);
        assert_eq!(c.max_call_depth, 50);
        assert_eq!(c.log.as_deref(), Some("debug"));
    }

    #[test]
    fn env_rejects_garbage() {
        let mut c = Config::default();
        let err = c.apply_env(env(&[("GARNET_INLINE", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("GARNET_INLINE"));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let c: Config = serde_json::from_str(r#"{"self_call": false}"#).unwrap();
        assert!(!c.self_call);
        assert!(c.jit);
    }
}
