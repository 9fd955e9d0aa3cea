// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Entity identifier generation and format checks.
//!
//! All ids are prefixed strings: `sess_<16 alnum>`, `exec_<yyyymmdd>_<8 alnum>`,
//! `tmpl_`, `art_` and `node_` plus 12 alphanumerics.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

fn random_lower_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(len)
        .collect()
}

pub fn new_session_id() -> String {
    format!("sess_{}", random_lower_alnum(16))
}

/// Execution ids carry the submission date so operators can shard logs by day.
pub fn new_execution_id() -> String {
    format!(
        "exec_{}_{}",
        Utc::now().format("%Y%m%d"),
        random_lower_alnum(8)
    )
}

pub fn new_template_id() -> String {
    format!("tmpl_{}", random_lower_alnum(12))
}

pub fn new_artifact_id() -> String {
    format!("art_{}", random_lower_alnum(12))
}

pub fn new_node_id() -> String {
    format!("node_{}", random_lower_alnum(12))
}

fn is_lower_alnum(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

pub fn is_session_id(id: &str) -> bool {
    match id.strip_prefix("sess_") {
        Some(rest) => rest.len() == 16 && is_lower_alnum(rest),
        None => false,
    }
}

pub fn is_execution_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("exec_") else {
        return false;
    };
    let mut parts = rest.splitn(2, '_');
    let (Some(date), Some(suffix)) = (parts.next(), parts.next()) else {
        return false;
    };
    date.len() == 8
        && date.chars().all(|c| c.is_ascii_digit())
        && suffix.len() == 8
        && is_lower_alnum(suffix)
}

pub fn is_template_id(id: &str) -> bool {
    matches!(id.strip_prefix("tmpl_"), Some(rest) if is_lower_alnum(rest))
}

pub fn is_node_id(id: &str) -> bool {
    matches!(id.strip_prefix("node_"), Some(rest) if is_lower_alnum(rest))
}

/// The canonical idempotency key for a result callback.
pub fn result_idempotency_key(execution_id: &str) -> String {
    format!("{}_result", execution_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        assert!(is_session_id(&id), "bad session id: {}", id);
        assert_eq!(id.len(), "sess_".len() + 16);
    }

    #[test]
    fn test_execution_id_format() {
        let id = new_execution_id();
        assert!(is_execution_id(&id), "bad execution id: {}", id);
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        assert!(!is_session_id("exec_20250101_abcd1234"));
        assert!(!is_execution_id("sess_abcdefgh12345678"));
        assert!(!is_session_id("sess_SHORT"));
        assert!(!is_session_id(""));
    }

    #[test]
    fn test_rejects_uppercase_and_symbols() {
        assert!(!is_session_id("sess_ABCDEFGH12345678"));
        assert!(!is_session_id("sess_abcdefgh1234567!"));
        assert!(!is_execution_id("exec_2025010a_abcd1234"));
    }

    #[test]
    fn test_idempotency_key_is_canonical() {
        assert_eq!(
            result_idempotency_key("exec_20250101_abcd1234"),
            "exec_20250101_abcd1234_result"
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }
}
