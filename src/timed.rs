//! Wall-clock deadlines for blocking protocol operations

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Run `op` with a deadline; expiry becomes [`Error::TimedOut`].
///
/// The operation's transport is left as-is on expiry. Callers that own
/// it are expected to shut the socket down so the hung peer cannot
/// wedge later commands.
pub(crate) async fn run_timed<T, F>(limit: Duration, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(rv) => rv,
        Err(_) => Err(Error::TimedOut),
    }
}
