//! Parse a project `.env` file into a key-value map. Application of the map to
//! the process environment (and its precedence rules) lives in `lib.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Location of `.env`: `override_dir` if given, else the current directory.
fn dotenv_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    (path.is_file()).then_some(path)
}

/// Minimal `.env` parser: `KEY=VALUE` lines, `#` comment lines, trimmed keys
/// and values. Double-quoted values support `\"`; single quotes are stripped
/// verbatim. No multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Load `.env` from `override_dir` or the current directory. A missing file is
/// not an error and yields an empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let path = match dotenv_path(override_dir) {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path)?;
    Ok(parse_dotenv(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_pairs_are_parsed() {
        let m = parse_dotenv("SLATE_A=1\nSLATE_B=two\n");
        assert_eq!(m.get("SLATE_A"), Some(&"1".to_string()));
        assert_eq!(m.get("SLATE_B"), Some(&"two".to_string()));
    }

    #[test]
    fn comments_blank_lines_and_bare_words_are_skipped() {
        let m = parse_dotenv("# header\n\nJUSTAWORD\nKEY=val\n   \n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY"), Some(&"val".to_string()));
    }

    #[test]
    fn quoting_rules() {
        let m = parse_dotenv("A=\"hello world\"\nB='single'\nC=\"say \\\"hi\\\"\"\nD=\"\"\n");
        assert_eq!(m.get("A"), Some(&"hello world".to_string()));
        assert_eq!(m.get("B"), Some(&"single".to_string()));
        assert_eq!(m.get("C"), Some(&"say \"hi\"".to_string()));
        assert_eq!(m.get("D"), Some(&"".to_string()));
    }

    #[test]
    fn empty_key_is_rejected() {
        let m = parse_dotenv("=only_value\nOK=1\n");
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_map(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn file_is_read_from_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "X=42\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("X"), Some(&"42".to_string()));
    }
}
