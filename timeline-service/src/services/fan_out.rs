//! Wait-for-all fan-out.

use futures::future::join_all;
use std::future::Future;

/// Drive every future to completion, then return all results in input order
/// or the first error by input position.
///
/// Unlike `try_join_all`, a failing branch does not drop its siblings, so
/// their side effects complete and stay in place even when the call fails.
pub async fn join_all_settled<I, F, T, E>(futures: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    join_all(futures).await.into_iter().collect()
}
