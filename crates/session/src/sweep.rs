//! Inactivity TTL sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opsloop_core::error::StoreError;
use opsloop_core::session::{SessionId, SessionStore};
use tracing::{info, warn};

/// Expire every open session idle for longer than `ttl` as of `now`.
///
/// Cancelled and failed sessions are still open (they can be resumed), so
/// they expire too. Returns the expired ids so the caller can release any
/// plugin-side resources tied to them. A session that cannot be expired is
/// logged and skipped.
pub async fn expire_idle(
    store: &dyn SessionStore,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<SessionId>, StoreError> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let mut expired = Vec::new();

    for summary in store.list().await? {
        if summary.status.is_closed() {
            continue;
        }
        let idle_until = summary
            .last_activity_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if idle_until >= now {
            continue;
        }

        // A session some loop is still driving is not idle, whatever its timestamp
        let _lock = match store.try_lock(&summary.id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(session_id = %summary.id, "Session is running, not expiring");
                continue;
            }
            Err(e) => {
                warn!(session_id = %summary.id, error = %e, "Failed to lock session for expiry");
                continue;
            }
        };

        match store.expire(&summary.id).await {
            Ok(_) => {
                info!(session_id = %summary.id, last_activity = %summary.last_activity_at, "Session expired");
                expired.push(summary.id);
            }
            Err(e) => warn!(session_id = %summary.id, error = %e, "Failed to expire session"),
        }
    }

    Ok(expired)
}
