//! Bounded-concurrency runner.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::try_join_all;

/// Run `run(item, index)` over `items` with at most `concurrency` in flight.
///
/// `min(concurrency, items.len())` workers share one cursor and claim
/// indices in order. Results are returned in item order. The first error
/// drops the remaining workers and is returned.
pub async fn run_with_concurrency<'a, T, R, E, F, Fut>(
    items: &'a [T],
    concurrency: usize,
    run: F,
) -> Result<Vec<R>, E>
where
    F: Fn(&'a T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let workers = concurrency.clamp(1, items.len());
    let cursor = AtomicUsize::new(0);
    let (cursor, run) = (&cursor, &run);

    let per_worker = try_join_all((0..workers).map(|_| async move {
        let mut done = Vec::new();
        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(item) = items.get(index) else {
                break;
            };
            done.push((index, run(item, index).await?));
        }
        Ok::<_, E>(done)
    }))
    .await?;

    let mut merged: Vec<(usize, R)> = per_worker.into_iter().flatten().collect();
    merged.sort_by_key(|(index, _)| *index);
    Ok(merged.into_iter().map(|(_, result)| result).collect())
}
