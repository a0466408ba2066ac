//! Tests for constants module.
//!
//! Validates ID helpers and the timing constants the lifecycle relies on.

use magikd::*;
use std::time::Duration;

// =============================================================================
// ID Tests
// =============================================================================

#[test]
fn test_generate_id_is_valid() {
    for _ in 0..100 {
        let id = generate_id();
        assert!(validate_id(&id).is_ok(), "generated invalid id {}", id);
    }
}

#[test]
fn test_generated_short_id_is_never_numeric() {
    for _ in 0..1000 {
        let id = generate_id();
        assert!(truncate_id(&id).parse::<u64>().is_err());
    }
}

#[test]
fn test_generated_ids_are_unique() {
    let ids: std::collections::HashSet<String> = (0..100).map(|_| generate_id()).collect();
    assert_eq!(ids.len(), 100);
}

#[test]
fn test_validate_id_rejects_bad_input() {
    assert!(validate_id("").is_err());
    assert!(validate_id("abc").is_err());
    assert!(validate_id(&"A".repeat(ID_LEN)).is_err());
    assert!(validate_id(&format!("../{}", "a".repeat(ID_LEN - 3))).is_err());
    assert!(validate_id(&"a".repeat(ID_LEN + 1)).is_err());
    assert!(validate_id(&"a".repeat(ID_LEN)).is_ok());
}

#[test]
fn test_truncate_id() {
    let id = "0123456789abcdef".repeat(4);
    assert_eq!(truncate_id(&id), "0123456789ab");
    assert_eq!(truncate_id("short"), "short");
    assert_eq!(truncate_id(&id).len(), SHORT_ID_LEN);
}

// =============================================================================
// Lifecycle Constants
// =============================================================================

#[test]
fn test_exit_codes() {
    assert_eq!(START_FAILURE_EXIT_CODE, 128);
    assert_eq!(RECONCILED_EXIT_CODE, -127);
    assert_eq!(RUN_ERROR_EXIT_CODE, -1);
}

#[test]
fn test_restart_backoff_ordering() {
    assert_eq!(RESTART_BACKOFF_INITIAL, Duration::from_millis(100));
    assert!(RESTART_BACKOFF_RESET > RESTART_BACKOFF_INITIAL);
    assert_eq!(KILL_WAIT_TIMEOUT, Duration::from_secs(10));
}

#[test]
fn test_init_layer_suffix() {
    assert_eq!(format!("{}{}", "abc", INIT_LAYER_SUFFIX), "abc-init");
}

#[test]
fn test_default_path_env_has_standard_dirs() {
    for dir in ["/usr/local/bin", "/usr/bin", "/bin", "/sbin"] {
        assert!(DEFAULT_PATH_ENV.split(':').any(|d| d == dir), "missing {}", dir);
    }
}
