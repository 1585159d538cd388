//! # Layered configuration loader.
//!
//! ```text
//! application.properties            (or app_config_path; `.toml` files are read as TOML)
//!   └─ application-<profile>.properties   for each profile in app_profiles
//!        └─ environment variables
//!             └─ builder properties
//!                  └─ CLI arguments       (--key=value, -key=value, --flag)
//!                       └─ ${key:fallback} resolution
//! ```
//! Later layers win. Keys are normalized in every layer.

use std::path::{Path, PathBuf};

use clap::Parser;

use super::ConfigMap;
use super::keys::{self, normalize_key};
use crate::error::{BoxError, RuntimeError};

/// Maximum nesting of placeholder resolution.
pub const MAX_PLACEHOLDER_DEPTH: usize = 8;

const DEFAULT_FILE: &str = "application.properties";

/// Builds a [`ConfigMap`] from files, environment, properties and CLI arguments.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: Option<Vec<(String, String)>>,
    use_env: bool,
    properties: ConfigMap,
    args: Vec<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            file: None,
            env: None,
            use_env: true,
            properties: ConfigMap::new(),
            args: Vec::new(),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base config file (`.properties`, or TOML for a `.toml` extension).
    /// Missing files are an error when set explicitly.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Replaces the process environment with explicit variables.
    pub fn env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self.use_env = true;
        self
    }

    /// Skips the environment layer.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Adds a process property.
    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(normalize_key(key), value.into());
        self
    }

    /// Adds CLI arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Loads, merges and resolves every layer.
    pub fn load(&self) -> Result<ConfigMap, RuntimeError> {
        let env = self.env_layer();
        let cli = parse_args(&self.args)?;

        let lookup = |key: &str| {
            cli.get(key)
                .or_else(|| self.properties.get(key))
                .or_else(|| env.get(key))
                .cloned()
        };

        let (base_path, explicit) = match lookup(keys::CONFIG_PATH) {
            Some(path) => (PathBuf::from(path), true),
            None => match &self.file {
                Some(path) => (path.clone(), true),
                None => (PathBuf::from(DEFAULT_FILE), false),
            },
        };

        let mut merged = ConfigMap::new();
        match read_file(&base_path) {
            Ok(map) => merged.extend(map),
            Err(ReadError::Io(err)) if !explicit && err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(file_error(&base_path, err)),
        }

        let profiles = lookup(keys::PROFILES).or_else(|| merged.get(keys::PROFILES).cloned());
        for profile in profiles.iter().flat_map(|p| p.split(',')) {
            let profile = profile.trim();
            if profile.is_empty() {
                continue;
            }
            let path = profile_path(&base_path, profile);
            match read_file(&path) {
                Ok(map) => merged.extend(map),
                Err(ReadError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "profile file not found");
                }
                Err(err) => return Err(file_error(&path, err)),
            }
        }

        merged.extend(env);
        merged.extend(self.properties.clone());
        merged.extend(cli);
        resolve_placeholders(&mut merged);
        Ok(merged)
    }

    fn env_layer(&self) -> ConfigMap {
        if !self.use_env {
            return ConfigMap::new();
        }
        match &self.env {
            Some(vars) => vars
                .iter()
                .map(|(k, v)| (normalize_key(k), v.clone()))
                .collect(),
            None => std::env::vars()
                .map(|(k, v)| (normalize_key(&k), v))
                .collect(),
        }
    }
}

fn profile_path(base: &Path, profile: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("application");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{profile}.{ext}"),
        None => format!("{stem}-{profile}"),
    };
    base.with_file_name(name)
}

/// Command line accepted by the runtime: a flat list of settings.
#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct CliSettings {
    /// `--key=value`, `-key=value`, `key=value` or a bare `--flag`.
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true, value_parser = parse_setting)]
    settings: Vec<(String, String)>,
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    let body = raw.trim_start_matches('-');
    let (key, value) = match body.split_once('=') {
        Some(pair) => pair,
        None if raw.starts_with('-') => (body, "true"),
        None => return Err(format!("expected --key=value, got `{raw}`")),
    };
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    Ok((normalize_key(key), value.to_string()))
}

/// Decodes command-line settings; later occurrences of a key win.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<ConfigMap, RuntimeError> {
    let cli = CliSettings::try_parse_from(args.iter().map(AsRef::<str>::as_ref))
        .map_err(RuntimeError::Arguments)?;
    Ok(cli.settings.into_iter().collect())
}

/// Parses a `.properties` document.
pub fn parse_properties(text: &str) -> Result<ConfigMap, java_properties::PropertiesError> {
    let raw = java_properties::read(text.as_bytes())?;
    Ok(raw.into_iter().map(|(k, v)| (normalize_key(&k), v)).collect())
}

/// Parses a TOML document; nested tables become `table.key` entries.
pub fn parse_toml(text: &str) -> Result<ConfigMap, toml::de::Error> {
    let table: toml::Table = toml::from_str(text)?;
    let mut map = ConfigMap::new();
    flatten_toml("", &table, &mut map);
    Ok(map)
}

fn flatten_toml(prefix: &str, table: &toml::Table, out: &mut ConfigMap) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten_toml(&key, inner, out),
            other => {
                out.insert(normalize_key(&key), toml_scalar(other));
            }
        }
    }
}

fn toml_scalar(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items.iter().map(toml_scalar).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

enum ReadError {
    Io(std::io::Error),
    Parse(BoxError),
}

fn read_file(path: &Path) -> Result<ConfigMap, ReadError> {
    let text = std::fs::read_to_string(path).map_err(ReadError::Io)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&text).map_err(|e| ReadError::Parse(e.into())),
        _ => parse_properties(&text).map_err(|e| ReadError::Parse(e.into())),
    }
}

fn file_error(path: &Path, err: ReadError) -> RuntimeError {
    let path = path.display().to_string();
    match err {
        ReadError::Io(source) => RuntimeError::ConfigFile { path, source },
        ReadError::Parse(source) => RuntimeError::ConfigParse { path, source },
    }
}

/// Resolves `${key:fallback}` tokens in every value against the map itself.
pub fn resolve_placeholders(map: &mut ConfigMap) {
    let snapshot = map.clone();
    for value in map.values_mut() {
        if value.contains("${") {
            *value = resolve_value(value, &snapshot, 0);
        }
    }
}

fn resolve_value(raw: &str, map: &ConfigMap, depth: usize) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];
        let (key, fallback) = match token.split_once(':') {
            Some((k, f)) => (k, Some(f)),
            None => (token, None),
        };
        let resolved = map
            .get(&normalize_key(key))
            .map(String::as_str)
            .or(fallback);
        match resolved {
            Some(value) if depth + 1 < MAX_PLACEHOLDER_DEPTH && value.contains("${") => {
                out.push_str(&resolve_value(value, map, depth + 1));
            }
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn properties_parsing() {
        let parsed =
            parse_properties("# comment\n! also\nApp.Name = demo\nport:8080\nlong = a \\\n  b\n").unwrap();
        assert_eq!(parsed.get("app_name").map(String::as_str), Some("demo"));
        assert_eq!(parsed.get("port").map(String::as_str), Some("8080"));
        assert_eq!(parsed.get("long").map(String::as_str), Some("a b"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn toml_tables_are_flattened() {
        let parsed = parse_toml(
            "app_profiles = [\"dev\", \"local\"]\n[db]\nhost = \"localhost\"\nport = 5432\nssl = true\n",
        )
        .unwrap();
        assert_eq!(parsed["app_profiles"], "dev,local");
        assert_eq!(parsed["db_host"], "localhost");
        assert_eq!(parsed["db_port"], "5432");
        assert_eq!(parsed["db_ssl"], "true");
    }

    #[test]
    fn args_parsing() {
        let parsed = parse_args(&["--app.name=x", "-level=debug", "--verbose", "k=v", "--help"]).unwrap();
        assert_eq!(parsed.get("app_name").map(String::as_str), Some("x"));
        assert_eq!(parsed.get("level").map(String::as_str), Some("debug"));
        assert_eq!(parsed.get("verbose").map(String::as_str), Some("true"));
        assert_eq!(parsed.get("k").map(String::as_str), Some("v"));
        assert_eq!(parsed.get("help").map(String::as_str), Some("true"));
    }

    #[test]
    fn later_arguments_win() {
        let parsed = parse_args(&["--level=info", "--level=warn"]).unwrap();
        assert_eq!(parsed["level"], "warn");
        assert!(parse_args::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn stray_positional_is_rejected() {
        let err = parse_args(&["--level=info", "plain"]).unwrap_err();
        assert_eq!(err.as_label(), "runtime_arguments");
    }

    #[test]
    fn placeholders_nest_and_fall_back() {
        let mut m = map(&[
            ("base", "http://${host:localhost}:${port}"),
            ("port", "${default_port:80}"),
            ("url", "${base}/api"),
            ("missing", "${nope}"),
            ("fallback", "${nope:fb}"),
        ]);
        resolve_placeholders(&mut m);
        assert_eq!(m["url"], "http://localhost:80/api");
        assert_eq!(m["missing"], "${nope}");
        assert_eq!(m["fallback"], "fb");
    }

    #[test]
    fn self_reference_terminates() {
        let mut m = map(&[("a", "x${a}")]);
        resolve_placeholders(&mut m);
        assert!(m["a"].starts_with("xx"));
    }

    #[test]
    fn unterminated_token_is_kept() {
        let mut m = map(&[("a", "v${b")]);
        resolve_placeholders(&mut m);
        assert_eq!(m["a"], "v${b");
    }

    #[test]
    fn layers_override_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.properties");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "level=file\nfile_only=1\nsys_key=file").unwrap();

        let loaded = ConfigLoader::new()
            .file(&path)
            .env_vars([("LEVEL", "env"), ("ENV_ONLY", "2")])
            .property("level", "sys")
            .property("sys_key", "sys")
            .args(["--level=cli"])
            .load()
            .unwrap();
        assert_eq!(loaded["level"], "cli");
        assert_eq!(loaded["sys_key"], "sys");
        assert_eq!(loaded["file_only"], "1");
        assert_eq!(loaded["env_only"], "2");
    }

    #[test]
    fn profiles_are_layered_after_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("application.properties"), "name=base\napp.profiles=dev").unwrap();
        std::fs::write(dir.path().join("application-dev.properties"), "name=dev").unwrap();

        let loaded = ConfigLoader::new()
            .file(dir.path().join("application.properties"))
            .without_env()
            .load()
            .unwrap();
        assert_eq!(loaded["name"], "dev");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.toml");
        std::fs::write(&path, "key = = broken").unwrap();

        let err = ConfigLoader::new().file(&path).without_env().load().unwrap_err();
        assert_eq!(err.as_label(), "runtime_config_parse");
    }

    #[test]
    fn explicit_missing_file_fails() {
        let err = ConfigLoader::new()
            .file("/definitely/not/here.properties")
            .without_env()
            .load()
            .unwrap_err();
        assert_eq!(err.as_label(), "runtime_config_file");
    }
}
