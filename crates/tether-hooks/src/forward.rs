use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{HooksError, Result};

/// Run a scheduler call, giving up as soon as `cancel` fires.
///
/// Steps pass the execution's scheduler-call token, which an interrupt of
/// the job body does not cancel.
pub async fn forward<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = tether_scheduler::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HooksError::Cancelled),
        result = call => Ok(result?),
    }
}
