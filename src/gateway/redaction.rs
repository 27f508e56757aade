use std::collections::HashSet;

use regex::{NoExpand, Regex};
use serde_json::Value;

use super::config::{ConfigError, RedactionConfig};

/// Scrubs credentials out of JSON documents before they leave the process
/// (violation reports sent to the operator webhook).
#[derive(Debug)]
pub struct ReportRedactor {
    replacement: String,
    key_names: HashSet<String>,
    query_params: HashSet<String>,
    query_bearing_keys: HashSet<String>,
    patterns: Vec<Regex>,
}

impl Default for ReportRedactor {
    fn default() -> Self {
        Self::from_config(&RedactionConfig::default())
    }
}

impl ReportRedactor {
    /// Falls back to the default rules when `config` does not compile.
    pub fn from_config(config: &RedactionConfig) -> Self {
        match Self::try_new(config) {
            Ok(redactor) => redactor,
            Err(err) => {
                tracing::warn!(error = %err, "invalid redaction config, using defaults");
                Self::try_new(&RedactionConfig::default()).unwrap_or_else(|_| Self {
                    replacement: "<redacted>".to_string(),
                    key_names: HashSet::new(),
                    query_params: HashSet::new(),
                    query_bearing_keys: HashSet::new(),
                    patterns: Vec::new(),
                })
            }
        }
    }

    pub fn validate_config(config: &RedactionConfig) -> Result<(), ConfigError> {
        Self::try_new(config).map(|_| ())
    }

    fn try_new(config: &RedactionConfig) -> Result<Self, ConfigError> {
        let replacement = config.replacement.trim();
        if replacement.is_empty() {
            return Err(ConfigError::Invalid(
                "observability.redaction.replacement must not be empty".to_string(),
            ));
        }

        let mut patterns = Vec::new();
        for pattern in &config.redact_regexes {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|err| {
                ConfigError::Invalid(format!(
                    "invalid observability.redaction regex '{pattern}': {err}"
                ))
            })?;
            patterns.push(regex);
        }

        Ok(Self {
            replacement: replacement.to_string(),
            key_names: normalize_list(&config.redact_key_names),
            query_params: normalize_list(&config.redact_query_params),
            query_bearing_keys: normalize_list(&config.sanitize_query_in_keys),
            patterns,
        })
    }

    pub fn redact(&self, mut value: Value) -> Value {
        self.redact_in_place(&mut value, false);
        value
    }

    fn redact_in_place(&self, value: &mut Value, in_query_key: bool) {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
            Value::String(text) => {
                if in_query_key {
                    *text = redact_query_string(&self.query_params, &self.replacement, text);
                }
                for regex in &self.patterns {
                    if regex.is_match(text) {
                        *text = regex
                            .replace_all(text, NoExpand(&self.replacement))
                            .into_owned();
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_in_place(item, in_query_key);
                }
            }
            Value::Object(map) => {
                for (key, child) in map {
                    let key = normalize_name(key);
                    if self.key_names.contains(&key) {
                        *child = Value::String(self.replacement.clone());
                        continue;
                    }
                    let child_in_query =
                        in_query_key || self.query_bearing_keys.contains(&key);
                    self.redact_in_place(child, child_in_query);
                }
            }
        }
    }
}

fn normalize_list(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|value| normalize_name(value))
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_name(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Handles both full URLs and bare query strings (`a=1&b=2`).
fn redact_query_string(params: &HashSet<String>, replacement: &str, raw: &str) -> String {
    let (prefix, rest) = match raw.split_once('?') {
        Some((prefix, rest)) => (Some(prefix), rest),
        None if raw.contains('=') && !raw.contains(' ') => (None, raw),
        None => return raw.to_string(),
    };
    let (query, fragment) = match rest.split_once('#') {
        Some((query, fragment)) => (query, Some(fragment)),
        None => (rest, None),
    };

    let query = query
        .split('&')
        .map(|pair| {
            let key = pair.split_once('=').map_or(pair, |(key, _)| key);
            if params.contains(&normalize_name(key)) {
                format!("{key}={replacement}")
            } else {
                pair.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("&");

    let mut out = String::with_capacity(raw.len());
    if let Some(prefix) = prefix {
        out.push_str(prefix);
        out.push('?');
    }
    out.push_str(&query);
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
