//! # Engine Constants
//!
//! Timeouts, exit codes, naming rules and on-disk layout names for the
//! engine. These constants are the single source of truth for values that
//! are shared between the graph, the container store and the lifecycle code.
//!
//! ## Cross-References
//!
//! - [`crate::graph`]: Uses the image layout names
//! - [`crate::daemon`]: Uses timeouts, exit codes and container layout names
//! - [`crate::names`]: Uses the name validation rules

use std::time::Duration;

// =============================================================================
// Identifiers
// =============================================================================

/// Length in hex characters of a full container or image ID.
pub const ID_LEN: usize = 64;

/// Length of a truncated ("short") ID as shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Suffix of the init layer that sits between an image and a container layer.
pub const INIT_LAYER_SUFFIX: &str = "-init";

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code recorded when a start fails and the backend reported none.
pub const START_FAILURE_EXIT_CODE: i32 = 128;

/// Exit code recorded when the execution driver fails after the process
/// started.
pub const RUN_ERROR_EXIT_CODE: i32 = -1;

/// Exit code recorded at boot for a container that was persisted as running
/// but that the execution driver no longer knows about.
///
/// Distinct from any exit code a process can produce, so operators can tell
/// "died while the daemon was down" apart from a normal exit.
pub const RECONCILED_EXIT_CODE: i32 = -127;

// =============================================================================
// Timeouts
// =============================================================================

/// How long `kill` waits after SIGKILL before signalling the pid directly.
pub const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for `stop` between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial back-off between restarts of a container by restart policy.
pub const RESTART_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// A process that ran at least this long resets the restart back-off.
pub const RESTART_BACKOFF_RESET: Duration = Duration::from_secs(10);

// =============================================================================
// Naming
// =============================================================================

/// Characters allowed as the first character of a container name.
pub const NAME_FIRST_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Characters allowed after the first character of a container name.
pub const NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.-";

/// Human readable form of the name rule, used in error messages.
pub const NAME_PATTERN: &str = "[a-zA-Z0-9][a-zA-Z0-9_.-]";

/// Number of random names tried before falling back to the short ID.
pub const NAME_GENERATION_ATTEMPTS: usize = 6;

// =============================================================================
// Storage Layout
// =============================================================================
//
// All paths are relative to the configured root directory, typically
// `~/.magikd`.
// =============================================================================

/// Subdirectory holding one directory per container.
pub const CONTAINERS_DIR: &str = "containers";

/// Subdirectory holding one directory per image.
pub const GRAPH_DIR: &str = "graph";

/// Scratch directory inside the graph used for atomic register/delete.
pub const GRAPH_TMP_DIR: &str = "_tmp";

/// File name of the persisted link graph.
pub const LINKGRAPH_FILE: &str = "linkgraph.db";

/// Container run configuration file.
pub const CONFIG_FILE: &str = "config.json";

/// Container host configuration file.
pub const HOSTCONFIG_FILE: &str = "hostconfig.json";

/// Image metadata file.
pub const IMAGE_JSON_FILE: &str = "json";

/// Cached image layer size file.
pub const IMAGE_SIZE_FILE: &str = "layersize";

/// Default `PATH` inside containers that do not set one.
pub const DEFAULT_PATH_ENV: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host file consulted for DNS configuration.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Host file copied into host-networked containers.
pub const HOST_HOSTS: &str = "/etc/hosts";

// =============================================================================
// Container ID Validation Helper
// =============================================================================

/// Validates a full container or image ID.
///
/// IDs are exactly [`ID_LEN`] lowercase hex characters. Since IDs become
/// directory names, anything else is rejected before it reaches a path.
#[inline]
#[must_use = "validation result must be checked to ensure the ID is safe"]
pub fn validate_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.len() != ID_LEN {
        return Err("ID must be 64 hex characters");
    }
    if !id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err("ID contains non-hex characters");
    }
    Ok(())
}

/// Returns the short form of an ID.
pub fn truncate_id(id: &str) -> &str {
    &id[..SHORT_ID_LEN.min(id.len())]
}

/// Generates a random 64 hex character ID.
///
/// IDs that parse as an integer are regenerated so that short IDs never look
/// like a number to the user.
pub fn generate_id() -> String {
    loop {
        let bytes: [u8; 32] = rand::random();
        let id = hex::encode(bytes);
        if truncate_id(&id).parse::<u64>().is_err() {
            return id;
        }
    }
}
