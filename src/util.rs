//! Shared utility functions for the conductor crate.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Write `contents` to `path` without ever exposing a partial file.
///
/// The data goes to a sibling temp file which is synced and then renamed over
/// the target, so concurrent readers see either the old or the new content.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

/// Short lowercase hex digest, used for filesystem-safe keys.
pub fn short_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// Serde helpers for `Duration` fields expressed as (possibly fractional) seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs_f64();
        if secs.fract() == 0.0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(secs)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    /// Same as the parent module, for `Option<Duration>`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs = Option::<f64>::deserialize(deserializer)?;
            match secs {
                Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
                Some(s) => Err(serde::de::Error::custom(format!(
                    "duration must be a non-negative number of seconds, got {}",
                    s
                ))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here are the tasks: {"tasks": []}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"tasks": []}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("scope"), short_hash("scope"));
        assert_ne!(short_hash("scope-a"), short_hash("scope-b"));
        assert_eq!(short_hash("x").len(), 12);
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Timed {
        #[serde(with = "duration_secs")]
        timeout: std::time::Duration,
        #[serde(default, with = "duration_secs::option")]
        extra: Option<std::time::Duration>,
    }

    #[test]
    fn test_duration_secs_accepts_integers_and_fractions() {
        let t: Timed = toml::from_str("timeout = 30\nextra = 0.5").unwrap();
        assert_eq!(t.timeout, std::time::Duration::from_secs(30));
        assert_eq!(t.extra, Some(std::time::Duration::from_millis(500)));

        let t: Timed = toml::from_str("timeout = 1.25").unwrap();
        assert_eq!(t.timeout, std::time::Duration::from_millis(1250));
        assert!(t.extra.is_none());
    }

    #[test]
    fn test_duration_secs_rejects_negative() {
        let result: Result<Timed, _> = toml::from_str("timeout = -1");
        assert!(result.is_err());
    }
}
