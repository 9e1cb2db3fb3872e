//! Command Timeout Supervisor
//!
//! Each ready connection runs a small background task that periodically
//! looks at the oldest queued command. Replies arrive in order, so if the
//! head of the queue has waited longer than the command timeout nothing
//! behind it can complete either, and the whole connection is failed.
//!
//! ## Check Interval
//!
//! A quarter of the command timeout, clamped to 50ms..=250ms. Short
//! timeouts are detected promptly without the check turning into a busy
//! loop, and long timeouts are still noticed within a quarter second.

use crate::connection::handler::{Connection, Status};
use std::sync::Weak;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Shutdown reason used when the oldest command waits too long.
pub const COMMAND_TIMEOUT: &str = "Command timeout";

const MIN_CHECK_INTERVAL_MS: u64 = 50;
const MAX_CHECK_INTERVAL_MS: u64 = 250;

/// Returns how often a connection with this command timeout is checked.
pub fn check_interval(cmd_timeout: Duration) -> Duration {
    let quarter = (cmd_timeout.as_millis() as u64).div_ceil(4);
    Duration::from_millis(quarter.clamp(MIN_CHECK_INTERVAL_MS, MAX_CHECK_INTERVAL_MS))
}

/// The supervisor loop. Ends when the connection shuts down or is dropped.
pub(crate) async fn supervise(conn: Weak<Connection>) {
    let (mut status_rx, cmd_timeout) = match conn.upgrade() {
        Some(conn) => (conn.subscribe(), conn.cmd_timeout()),
        None => return,
    };

    let mut ticker = tokio::time::interval(check_interval(cmd_timeout));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(conn) = conn.upgrade() else {
                    return;
                };
                if let Some(age) = conn.head_age() {
                    if age > cmd_timeout {
                        warn!(
                            event = "timeout",
                            conn = conn.id(),
                            server = %conn.server(),
                            waited_ms = age.as_millis() as u64,
                            "Command timeout"
                        );
                        conn.shutdown_with(COMMAND_TIMEOUT);
                        return;
                    }
                }
            }
            result = status_rx.changed() => {
                if result.is_err() || *status_rx.borrow() == Status::Shutdown {
                    debug!("Timeout supervisor stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_interval_clamped() {
        assert_eq!(check_interval(Duration::from_millis(100)), Duration::from_millis(50));
        assert_eq!(check_interval(Duration::from_millis(600)), Duration::from_millis(150));
        assert_eq!(check_interval(Duration::from_millis(601)), Duration::from_millis(151));
        assert_eq!(check_interval(Duration::from_secs(5)), Duration::from_millis(250));
    }
}
