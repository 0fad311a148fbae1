//! `/stop`: cancel one session's turn, or every active turn.

use relay_core::SessionId;
use tracing::info;

use crate::app::AppState;

/// Execute the stop and return a human-readable report.
///
/// With a session id only that session's turn is cancelled. Without one
/// every active turn is cancelled (emergency stop). Queued messages of the
/// cancelled sessions are discarded by the failure path.
pub fn execute_stop(app: &AppState, target: Option<&SessionId>) -> String {
    let report = match target {
        Some(session_id) => {
            if app.dispatcher.stop(session_id) {
                format!("Turn cancelled for `{session_id}`")
            } else {
                format!("No active turn for `{session_id}`")
            }
        }
        None => match app.dispatcher.stop_all() {
            0 => "No active turns".to_string(),
            n => format!("Emergency stop executed: {n} turn(s) cancelled"),
        },
    };
    info!(session = ?target.map(SessionId::as_str), "/stop executed: {report}");
    report
}
