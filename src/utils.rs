//! Shared utility helpers.

/// Generate a short random hex id for synthetic tool-call ids, CLI
/// temp file names, and message ids.
///
/// Half a v4 UUID: 16 hex chars is plenty for these in-process,
/// short-lived identifiers, and keeps CLI temp paths readable.
pub fn generate_nonce() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Current wall-clock time as Unix-epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Return true when the named environment flag is set.
///
/// A flag counts as set when its trimmed, lowercased value is one of
/// `"1"`, `"true"`, `"yes"`. All kill-switches (`ANT_DISABLE_*`,
/// `ANT_EXEC_BLOCK_DELETE`) go through this one recognizer.
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

/// True when the process runs under a test harness (`NODE_ENV=test` is
/// preserved for compatibility with the original deployment scripts).
pub fn is_test_env() -> bool {
    std::env::var("NODE_ENV")
        .map(|v| v.trim().eq_ignore_ascii_case("test"))
        .unwrap_or(false)
}

/// True when destructive file-delete operations must be refused
/// (`ANT_EXEC_BLOCK_DELETE`). Tool implementations consult this guard
/// before removing anything.
pub fn exec_block_delete() -> bool {
    env_flag("ANT_EXEC_BLOCK_DELETE")
}

/// Truncate to at most `max` characters, appending `…` when trimmed.
/// Bounds error excerpts and owner-notification summaries.
pub fn truncate_str(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_recognizes_truthy_values() {
        std::env::set_var("ANT_TEST_FLAG_A", " TRUE ");
        assert!(env_flag("ANT_TEST_FLAG_A"));
        std::env::set_var("ANT_TEST_FLAG_A", "yes");
        assert!(env_flag("ANT_TEST_FLAG_A"));
        std::env::set_var("ANT_TEST_FLAG_A", "1");
        assert!(env_flag("ANT_TEST_FLAG_A"));
        std::env::set_var("ANT_TEST_FLAG_A", "0");
        assert!(!env_flag("ANT_TEST_FLAG_A"));
        std::env::remove_var("ANT_TEST_FLAG_A");
        assert!(!env_flag("ANT_TEST_FLAG_A"));
    }

    #[test]
    fn truncate_preserves_short_strings() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello…");
        // Counts characters, not bytes.
        assert_eq!(truncate_str("héllo wörld", 5), "héllo…");
    }

    #[test]
    fn nonce_is_hex_and_unique_enough() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // Two consecutive nonces colliding would mean a broken hasher.
        assert_ne!(a, b);
    }
}
