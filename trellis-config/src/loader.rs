// INI settings model: parse, typed access, mutation, dump.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::{ConfigDelete, ConfigUpdate};

/// Parsed settings: section -> key -> value.
///
/// Sections and keys are stored sorted so `dump()` output is stable across
/// load/apply/save round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and parse an INI file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse INI text.
    ///
    /// Grammar: `[section]` lines open a section; `key = value` lines add
    /// entries to the current section; `#` and `;` start comments; blank
    /// lines are skipped. A `key = value` line before any section header is
    /// an error.
    pub fn parse(content: &str) -> Result<Self> {
        let mut settings = Settings::new();
        let mut current: Option<String> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| ConfigError::Parse {
                    line: idx + 1,
                    message: format!("unterminated section header: {raw}"),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConfigError::Parse {
                        line: idx + 1,
                        message: "empty section name".into(),
                    });
                }
                settings.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                line: idx + 1,
                message: format!("expected 'key = value', got: {raw}"),
            })?;
            let section = current.as_ref().ok_or_else(|| ConfigError::Parse {
                line: idx + 1,
                message: "key/value outside of any [section]".into(),
            })?;
            settings
                .sections
                .get_mut(section)
                .map(|s| s.insert(key.trim().to_string(), value.trim().to_string()));
        }

        Ok(settings)
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    pub fn get_i64(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_f64(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Truthy values: 1 / true / yes / on (case-insensitive).
    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            None => default,
        }
    }

    /// Comma-separated list with whitespace trimming, empty items dropped.
    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        self.get(section, key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All key/value pairs of one section.
    pub fn section(&self, name: &str) -> Vec<(String, String)> {
        self.sections
            .get(name)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Remove one key; empty sections are kept so the dump shows them.
    pub fn remove(&mut self, section: &str, key: &str) -> bool {
        self.sections
            .get_mut(section)
            .map(|s| s.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Apply an `/admin/config` update batch. Returns the number of
    /// mutations performed.
    pub fn apply_updates(&mut self, updates: &[ConfigUpdate], deletes: &[ConfigDelete]) -> usize {
        let mut applied = 0;
        for u in updates {
            if u.section.is_empty() || u.key.is_empty() {
                continue;
            }
            self.set(&u.section, &u.key, &u.value);
            applied += 1;
        }
        for d in deletes {
            if self.remove(&d.section, &d.key) {
                applied += 1;
            }
        }
        applied
    }

    /// Render the settings back to INI text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            for (k, v) in entries {
                out.push_str(k);
                out.push_str(" = ");
                out.push_str(v);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    /// Persist the current settings as INI.
    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.dump())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# trellis sample
[global]
listen_port = 8080
threads = 4
strategy = weighted
reuse_port = 1

[rate_limit]
qps = 100.5
burst = 200

[backends]
b1 = 10.0.0.1:9000
"#;

    #[test]
    fn test_parse_and_get() {
        let s = Settings::parse(SAMPLE).unwrap();
        assert_eq!(s.get_i64("global", "listen_port", 0), 8080);
        assert_eq!(s.get_str("global", "strategy", "roundrobin"), "weighted");
        assert!(s.get_bool("global", "reuse_port", false));
        assert_eq!(s.get_f64("rate_limit", "qps", 0.0), 100.5);
        assert_eq!(s.get_i64("rate_limit", "missing", 7), 7);
    }

    #[test]
    fn test_parse_rejects_orphan_pairs() {
        let err = Settings::parse("listen_port = 8080\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_bad_section() {
        assert!(Settings::parse("[global\n").is_err());
        assert!(Settings::parse("[]\n").is_err());
    }

    #[test]
    fn test_dump_round_trip() {
        let s = Settings::parse(SAMPLE).unwrap();
        let again = Settings::parse(&s.dump()).unwrap();
        assert_eq!(s, again);
    }

    #[test]
    fn test_apply_updates() {
        let mut s = Settings::parse(SAMPLE).unwrap();
        let n = s.apply_updates(
            &[ConfigUpdate {
                section: "global".into(),
                key: "threads".into(),
                value: "8".into(),
            }],
            &[ConfigDelete {
                section: "rate_limit".into(),
                key: "burst".into(),
            }],
        );
        assert_eq!(n, 2);
        assert_eq!(s.get_i64("global", "threads", 0), 8);
        assert!(s.get("rate_limit", "burst").is_none());
    }

    #[test]
    fn test_get_list() {
        let s = Settings::parse("[batch]\npaths = /a, /b ,, /c\n").unwrap();
        assert_eq!(s.get_list("batch", "paths"), vec!["/a", "/b", "/c"]);
    }
}
