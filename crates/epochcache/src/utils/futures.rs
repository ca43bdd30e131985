use std::future::Future;

use futures::future::{self, Either};
use futures::pin_mut;

/// Races a fallible `primary` future against an optional `fallback`.
///
/// Resolves to the first value that either of them produces. If the one that settles first
/// has no value, the other one is awaited. The error of `primary` is only returned when the
/// `fallback` has no value either. The losing future is dropped.
pub async fn first_ok<T, E, P, F>(primary: P, fallback: F) -> Result<T, E>
where
    P: Future<Output = Result<T, E>>,
    F: Future<Output = Option<T>>,
{
    pin_mut!(primary);
    pin_mut!(fallback);

    match future::select(primary, fallback).await {
        Either::Left((Ok(value), _)) => Ok(value),
        Either::Left((Err(err), fallback)) => fallback.await.ok_or(err),
        Either::Right((Some(value), _)) => Ok(value),
        Either::Right((None, primary)) => primary.await,
    }
}
