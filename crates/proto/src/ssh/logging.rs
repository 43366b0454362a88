//! Structured logging for SSH sessions
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Session identifiers and exchange hashes are logged as hex.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets
//! - **DEBUG**: Negotiated algorithms, channel bookkeeping
//! - **INFO**: State transitions, key exchanges, channel open/close
//! - **WARN**: Unusual but survivable peer behaviour
//! - **ERROR**: Fatal session errors, authentication failures
//!
//! # Example
//!
//! ```no_run
//! use latch_proto::ssh::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("latch_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition(&[0xab, 0xcd], "Ready", "Rekeying");
//! ```

use tracing::{error, info, warn};

/// Log a transport state transition
///
/// # Arguments
///
/// * `session_id` - Session identifier, empty before the first exchange
/// * `old_state` - Previous state
/// * `new_state` - New state
pub fn log_state_transition(session_id: &[u8], old_state: &str, new_state: &str) {
    info!(
        session_id = %hex::encode(session_id),
        state_from = old_state,
        state_to = new_state,
        "Transport state transition"
    );
}

/// Log session establishment start
///
/// # Arguments
///
/// * `peer_version` - Peer identification string
/// * `role` - "client" or "server"
pub fn log_handshake_start(peer_version: &str, role: &str) {
    info!(
        peer_version = peer_version,
        role = role,
        "SSH handshake started"
    );
}

/// Log session establishment completion
///
/// # Arguments
///
/// * `session_id` - Session identifier
/// * `duration_ms` - Handshake duration in milliseconds
pub fn log_handshake_complete(session_id: &[u8], duration_ms: u64) {
    info!(
        session_id = %hex::encode(session_id),
        duration_ms = duration_ms,
        "SSH handshake completed successfully"
    );
}

/// Log session establishment failure
///
/// # Arguments
///
/// * `error` - Error message
pub fn log_handshake_failed(error: &str) {
    error!(error = error, "SSH handshake failed");
}

/// Log the start of a rekey
///
/// # Arguments
///
/// * `session_id` - Session identifier
/// * `reason` - What triggered it (e.g., "peer", "requested", "limits", "interval")
pub fn log_rekey_start(session_id: &[u8], reason: &str) {
    info!(
        session_id = %hex::encode(session_id),
        reason = reason,
        "Rekey started"
    );
}

/// Log rekey completion
///
/// # Arguments
///
/// * `session_id` - Session identifier
/// * `exchange_hash` - New exchange hash
/// * `kex_count` - Completed exchanges so far
pub fn log_rekey_complete(session_id: &[u8], exchange_hash: &[u8], kex_count: u64) {
    info!(
        session_id = %hex::encode(session_id),
        exchange_hash = %hex::encode(exchange_hash),
        kex_count = kex_count,
        "Rekey completed successfully"
    );
}

/// Log channel open
///
/// # Arguments
///
/// * `local_id` - Local channel id
/// * `remote_id` - Peer channel id
/// * `channel_type` - Channel type name
pub fn log_channel_open(local_id: u32, remote_id: u32, channel_type: &str) {
    info!(
        channel = local_id,
        remote = remote_id,
        channel_type = channel_type,
        "Channel opened"
    );
}

/// Log channel teardown
///
/// # Arguments
///
/// * `local_id` - Local channel id
pub fn log_channel_closed(local_id: u32) {
    info!(channel = local_id, "Channel closed");
}

/// Log session termination
///
/// # Arguments
///
/// * `reason` - Disconnect reason code, if a DISCONNECT was exchanged
/// * `description` - Human-readable cause
/// * `local` - Whether the cause is on this side
pub fn log_disconnect(reason: Option<u32>, description: &str, local: bool) {
    if local {
        warn!(
            reason = reason,
            description = description,
            "Session terminating"
        );
    } else {
        info!(
            reason = reason,
            description = description,
            "Peer disconnected"
        );
    }
}

/// Log authentication success
///
/// # Arguments
///
/// * `user` - User name
/// * `method` - Method that succeeded (e.g., "password")
pub fn log_authentication_success(user: &str, method: &str) {
    info!(user = user, method = method, "User authenticated successfully");
}

/// Log authentication failure
///
/// # Arguments
///
/// * `user` - User name
/// * `reason` - Failure reason
pub fn log_authentication_failed(user: &str, reason: &str) {
    error!(user = user, reason = reason, "User authentication failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        // These only check the helpers run; output needs a subscriber

        log_state_transition(&[0x01, 0x02], "Ready", "Rekeying");
        log_handshake_start("SSH-2.0-OpenSSH_9.6", "client");
        log_handshake_complete(&[0x01, 0x02], 42);
        log_handshake_failed("no common cipher");
        log_rekey_start(&[0x01], "limits");
        log_rekey_complete(&[0x01], &[0x02], 2);
        log_channel_open(0, 5, "session");
        log_channel_closed(0);
        log_disconnect(Some(11), "bye", true);
        log_disconnect(None, "connection reset", false);
        log_authentication_success("alice", "password");
        log_authentication_failed("alice", "no more methods");
    }
}
