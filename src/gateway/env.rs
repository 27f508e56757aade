use std::collections::BTreeMap;
use std::path::Path;

/// Override source for [`RelayConfig::apply_env`](super::RelayConfig::apply_env).
///
/// Keys read from an operator's dotenv file shadow the process environment.
/// Blank values count as unset in both.
#[derive(Clone, Default)]
pub struct Env {
    file: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("file_keys", &self.file.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Env {
    pub fn from_dotenv_str(contents: &str) -> Self {
        let file = contents
            .lines()
            .filter_map(dotenv_entry)
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        Self { file }
    }

    pub fn load_dotenv(path: &Path) -> std::io::Result<Self> {
        std::fs::read_to_string(path).map(|contents| Self::from_dotenv_str(&contents))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.file
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.trim().parse().ok()
    }
}

/// `KEY=value`, optionally prefixed with `export`. Quoted values are taken
/// verbatim; unquoted ones stop at a ` #` comment.
fn dotenv_entry(line: &str) -> Option<(&str, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = value.trim();
    let value = match value.chars().next() {
        Some(quote @ ('"' | '\'')) => value[1..].split(quote).next().unwrap_or_default(),
        _ => value.split(" #").next().unwrap_or_default().trim_end(),
    };
    if value.is_empty() {
        return None;
    }
    Some((key, value.to_string()))
}
