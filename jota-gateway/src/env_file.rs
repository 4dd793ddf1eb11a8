//! `.env` configuration loader.
//!
//! Deployment configuration lives in a `.env` file of `KEY=VALUE` lines:
//! `#` starts a comment, whitespace around keys and values is trimmed, and
//! matching surrounding single or double quotes are stripped. Later
//! assignments win. Keys absent from the file fall back to the process
//! environment.

use std::collections::HashMap;
use std::path::Path;

/// Parsed contents of a `.env` file.
#[derive(Debug, Default)]
pub struct EnvFile {
    values: HashMap<String, String>,
}

impl EnvFile {
    /// Load from `path`. A missing file is an error; a present file always
    /// parses (malformed lines are skipped).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        tracing::info!("Loading configuration from {}", path.display());
        Ok(Self::parse(&content))
    }

    /// Try `./.env`, then `../.env` (covers running from a build directory).
    /// Returns an empty map when neither exists, so lookups fall through to
    /// the process environment.
    pub fn load_default() -> Self {
        for candidate in [".env", "../.env"] {
            let path = Path::new(candidate);
            if path.exists() {
                if let Ok(env) = Self::load(path) {
                    return env;
                }
            }
        }
        tracing::warn!(".env file not found in current or parent directory");
        Self::default()
    }

    fn parse(content: &str) -> Self {
        let mut values = HashMap::new();

        for line in content.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), unquote(value.trim()).to_string());
        }

        Self { values }
    }

    /// Value for `key`: the file wins, the process environment is the
    /// fallback.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        std::env::var(key).ok()
    }

    pub fn lookup_or(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_basic_key_values() {
        let env = EnvFile::parse("KEY=value\nOTHER=123\n");
        assert_eq!(env.lookup("KEY").as_deref(), Some("value"));
        assert_eq!(env.lookup("OTHER").as_deref(), Some("123"));
    }

    #[test]
    fn test_comments_are_ignored() {
        let env = EnvFile::parse("# full line comment\nKEY=value # trailing comment\n");
        assert_eq!(env.lookup("KEY").as_deref(), Some("value"));
        assert!(env.values.get("# full line comment").is_none());
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let env = EnvFile::parse("   SPACED  =  spaced value  \n");
        assert_eq!(env.lookup("SPACED").as_deref(), Some("spaced value"));
    }

    #[test]
    fn test_quotes_are_stripped() {
        let env = EnvFile::parse("A=\"double quoted\"\nB='single quoted'\nC=\"mismatched'\n");
        assert_eq!(env.lookup("A").as_deref(), Some("double quoted"));
        assert_eq!(env.lookup("B").as_deref(), Some("single quoted"));
        assert_eq!(env.lookup("C").as_deref(), Some("\"mismatched'"));
    }

    #[test]
    fn test_last_assignment_wins() {
        let env = EnvFile::parse("KEY=first\nKEY=second\n");
        assert_eq!(env.lookup("KEY").as_deref(), Some("second"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let env = EnvFile::parse("no equals sign\n=novalue\nGOOD=yes\n");
        assert_eq!(env.lookup("GOOD").as_deref(), Some("yes"));
        assert_eq!(env.values.len(), 1);
    }

    #[test]
    fn test_process_env_fallback() {
        std::env::set_var("JOTA_ENV_FILE_TEST_KEY", "from_process");
        let env = EnvFile::parse("");
        assert_eq!(
            env.lookup("JOTA_ENV_FILE_TEST_KEY").as_deref(),
            Some("from_process")
        );
        std::env::remove_var("JOTA_ENV_FILE_TEST_KEY");
    }

    #[test]
    fn test_file_wins_over_process_env() {
        std::env::set_var("JOTA_ENV_FILE_TEST_PRECEDENCE", "from_process");
        let env = EnvFile::parse("JOTA_ENV_FILE_TEST_PRECEDENCE=from_file\n");
        assert_eq!(
            env.lookup("JOTA_ENV_FILE_TEST_PRECEDENCE").as_deref(),
            Some("from_file")
        );
        std::env::remove_var("JOTA_ENV_FILE_TEST_PRECEDENCE");
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "DISK_KEY=disk_value").unwrap();

        let env = EnvFile::load(&path).unwrap();
        assert_eq!(env.lookup("DISK_KEY").as_deref(), Some("disk_value"));
    }

    #[test]
    fn test_lookup_or_default() {
        let env = EnvFile::parse("");
        assert_eq!(env.lookup_or("JOTA_ENV_FILE_TEST_MISSING", "dflt"), "dflt");
    }
}
