//! Key normalization between external key formats and the hierarchical
//! `section:sub:key` convention used by the configuration tree.
//!
//! Every key stored in a provider cache has passed through one of these
//! helpers, so cached keys are always lower-case and `:`-delimited.

/// Separator between sections of a hierarchical configuration key.
pub const KEY_DELIMITER: &str = ":";

/// Nested-key separator used by secret payloads (`Section__Key`).
pub const SECRET_KEY_DELIMITER: &str = "__";

/// Separator used inside flag keys once the prefix has been stripped.
pub const FLAG_KEY_DELIMITER: char = '-';

/// Normalizes a caller supplied lookup key.
pub fn lookup_key(key: &str) -> String {
    key.to_lowercase()
}

/// Converts a secret payload key (`Section__Key`) into `section:key`.
pub fn secret_key(raw: &str) -> String {
    raw.replace(SECRET_KEY_DELIMITER, KEY_DELIMITER).to_lowercase()
}

/// Converts a flag key into a configuration key.
///
/// Returns `None` when `raw` does not start with `prefix`; otherwise the
/// prefix is stripped and every `-` becomes `:`.
pub fn flag_key(raw: &str, prefix: &str) -> Option<String> {
    raw.strip_prefix(prefix)
        .map(|rest| rest.replace(FLAG_KEY_DELIMITER, KEY_DELIMITER).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_replaces_double_underscore() {
        assert_eq!(secret_key("Foo__Bar"), "foo:bar");
        assert_eq!(secret_key("BAZ"), "baz");
        assert_eq!(secret_key("A__B__C"), "a:b:c");
    }

    #[test]
    fn test_secret_key_keeps_single_underscore() {
        assert_eq!(secret_key("Connection_String__Main"), "connection_string:main");
    }

    #[test]
    fn test_flag_key_requires_prefix() {
        assert_eq!(flag_key("configure-backend-foo-bar", "configure-backend-"), Some("foo:bar".into()));
        assert_eq!(flag_key("other-key", "configure-backend-"), None);
    }

    #[test]
    fn test_flag_key_prefix_only() {
        assert_eq!(flag_key("configure-backend-", "configure-backend-"), Some(String::new()));
    }

    #[test]
    fn test_lookup_key_is_case_insensitive() {
        assert_eq!(lookup_key("Foo:Bar"), lookup_key("foo:bar"));
    }
}
