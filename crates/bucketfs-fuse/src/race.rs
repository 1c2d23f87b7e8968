//! First-success-wins execution of competing remote calls.

use tokio::sync::mpsc;

use crate::error::{FsError, Result};
use crate::store::BoxFuture;

/// Runs every attempt concurrently and returns the first success.
///
/// Losing attempts keep running in the background and their results are
/// dropped. If every attempt fails, the most relevant error is returned.
pub async fn first_success<T>(attempts: Vec<BoxFuture<'static, Result<T>>>) -> Result<T>
where
    T: Send + 'static,
{
    let total = attempts.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));
    for attempt in attempts {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(attempt.await).await;
        });
    }
    drop(tx);

    let mut failure: Option<FsError> = None;
    while let Some(res) = rx.recv().await {
        match res {
            Ok(v) => return Ok(v),
            Err(e) => {
                failure = Some(match failure {
                    Some(prev) => prev.most_relevant(e),
                    None => e,
                })
            }
        }
    }
    Err(failure.unwrap_or_else(|| FsError::Io {
        msg: "no attempts made".to_string(),
    }))
}

/// Runs attempts one after another, stopping at the first success.
pub async fn first_success_sequential<T>(attempts: Vec<BoxFuture<'static, Result<T>>>) -> Result<T> {
    let mut failure: Option<FsError> = None;
    for attempt in attempts {
        match attempt.await {
            Ok(v) => return Ok(v),
            Err(e) => {
                failure = Some(match failure {
                    Some(prev) => prev.most_relevant(e),
                    None => e,
                })
            }
        }
    }
    Err(failure.unwrap_or_else(|| FsError::Io {
        msg: "no attempts made".to_string(),
    }))
}
