//! Optimistic transactions for operations whose key set is not known
//! up front.
//!
//! The pattern is always the same: `WATCH` the keys the decision
//! depends on, read them, check preconditions (calling [`abort`] on
//! failure so the connection goes back to the pool clean), then
//! [`commit`] a `MULTI`/`EXEC` pipeline.  A `None` commit means a
//! watched key changed and the whole attempt is repeated, up to
//! [`MAX_ATTEMPTS`] times.

use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;

pub(crate) const MAX_ATTEMPTS: u32 = 10;

pub(crate) async fn watch(conn: &mut MultiplexedConnection, keys: &[String]) -> Result<()> {
    redis::cmd("WATCH").arg(keys).query_async::<_, ()>(conn).await?;
    Ok(())
}

/// Releases the watched keys and fails with `error`.
pub(crate) async fn abort<T>(conn: &mut MultiplexedConnection, error: Error) -> Result<T> {
    redis::cmd("UNWATCH").query_async::<_, ()>(conn).await?;
    Err(error)
}

/// Executes `pipe` as a transaction.  Returns `false` when a watched
/// key changed and nothing was written.
pub(crate) async fn commit(conn: &mut MultiplexedConnection, pipe: &mut redis::Pipeline) -> Result<bool> {
    let reply: Option<redis::Value> = pipe.atomic().query_async(conn).await?;
    Ok(reply.is_some())
}

pub(crate) fn conflict(operation: &'static str) -> Error {
    tracing::warn!(operation, attempts = MAX_ATTEMPTS, "giving up on contended transaction");
    Error::TransactionConflict {
        operation,
        attempts: MAX_ATTEMPTS,
    }
}
