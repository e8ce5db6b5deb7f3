//! Private key source loading for the wallet pool.
//!
//! Two formats are accepted, chosen by file extension:
//! - `.json`: an array of raw key strings, or of objects with a `privateKey`
//!   string field;
//! - anything else: one key per line, with an optional header line equal
//!   (case-insensitively) to `privatekey`.

use std::path::Path;

use serde::Deserialize;

use crate::pool::PoolError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyEntry {
    Raw(String),
    Keyed {
        #[serde(rename = "privateKey")]
        private_key: String,
    },
}

/// Ensures a hex string is `0x`-prefixed, optionally enforcing an exact byte
/// length. Hex content itself is not validated here; the signer constructor
/// does that.
pub fn ensure_0x_prefix(raw: &str, bytes: Option<usize>) -> Result<String, PoolError> {
    let trimmed = raw.trim();
    let value = if trimmed.starts_with("0x") {
        trimmed.to_string()
    } else {
        format!("0x{trimmed}")
    };
    if let Some(bytes) = bytes {
        let expected = 2 + bytes * 2;
        if value.len() != expected {
            return Err(PoolError::InvalidConfig {
                name: "privateKey",
                reason: format!(
                    "expected 0x-prefixed hex string of {bytes} bytes (length {expected}), got length {}",
                    value.len()
                ),
            });
        }
    }
    Ok(value)
}

/// Loads and parses the key source at `path`.
///
/// # Errors
/// - [`PoolError::Io`] if the file cannot be read.
/// - [`PoolError::InvalidKeySource`] if a JSON source has the wrong shape.
/// - [`PoolError::NoKeysFound`] if the source yields zero usable keys.
pub fn load_private_keys(path: &Path) -> Result<Vec<String>, PoolError> {
    let text = std::fs::read_to_string(path).map_err(|source| PoolError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let keys = if path.extension().is_some_and(|ext| ext == "json") {
        parse_json(path, &text)?
    } else {
        parse_delimited(&text)
    };

    if keys.is_empty() {
        return Err(PoolError::NoKeysFound {
            path: path.to_path_buf(),
        });
    }
    Ok(keys)
}

fn parse_delimited(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case("privatekey"))
        .map(str::to_string)
        .collect()
}

fn parse_json(path: &Path, text: &str) -> Result<Vec<String>, PoolError> {
    let entries: Vec<KeyEntry> =
        serde_json::from_str(text).map_err(|e| PoolError::InvalidKeySource {
            path: path.to_path_buf(),
            reason: format!("expected an array of strings or objects with a privateKey field: {e}"),
        })?;

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            KeyEntry::Raw(key) | KeyEntry::Keyed { private_key: key } => key,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn delimited_source_skips_the_header_and_blank_lines() {
        let file = write_source(".csv", "privateKey\n0xaa\n\n  0xbb  \n");
        let keys = load_private_keys(file.path()).unwrap();
        assert_eq!(keys, vec!["0xaa", "0xbb"]);
    }

    #[test]
    fn delimited_header_match_is_case_insensitive() {
        let file = write_source(".csv", "PRIVATEKEY\n0xaa\n");
        let keys = load_private_keys(file.path()).unwrap();
        assert_eq!(keys, vec!["0xaa"]);
    }

    #[test]
    fn json_source_accepts_strings_and_keyed_objects() {
        let file = write_source(
            ".json",
            r#"["0xaa", {"privateKey": "0xbb"}, {"privateKey": "0xcc", "label": "spare"}]"#,
        );
        let keys = load_private_keys(file.path()).unwrap();
        assert_eq!(keys, vec!["0xaa", "0xbb", "0xcc"]);
    }

    #[test]
    fn json_source_with_the_wrong_shape_fails() {
        let file = write_source(".json", r#"[1, 2, 3]"#);
        assert!(matches!(
            load_private_keys(file.path()),
            Err(PoolError::InvalidKeySource { .. })
        ));

        let file = write_source(".json", r#"{"privateKey": "0xaa"}"#);
        assert!(matches!(
            load_private_keys(file.path()),
            Err(PoolError::InvalidKeySource { .. })
        ));
    }

    #[test]
    fn empty_sources_fail_with_no_keys_found() {
        let file = write_source(".csv", "privateKey\n\n");
        assert!(matches!(
            load_private_keys(file.path()),
            Err(PoolError::NoKeysFound { .. })
        ));

        let file = write_source(".json", "[]");
        assert!(matches!(
            load_private_keys(file.path()),
            Err(PoolError::NoKeysFound { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let missing = Path::new("/definitely/not/here.csv");
        assert!(matches!(
            load_private_keys(missing),
            Err(PoolError::Io { .. })
        ));
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(ensure_0x_prefix("abcd", None).unwrap(), "0xabcd");
        assert_eq!(ensure_0x_prefix("0xabcd", None).unwrap(), "0xabcd");
        assert_eq!(ensure_0x_prefix("  0xabcd  ", None).unwrap(), "0xabcd");
        assert!(ensure_0x_prefix("abcd", Some(32)).is_err());
        let full = "11".repeat(32);
        assert_eq!(
            ensure_0x_prefix(&full, Some(32)).unwrap(),
            format!("0x{full}")
        );
    }
}
