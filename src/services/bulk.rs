use std::future::Future;

use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service::update_rows_by_ids;

/// A chunked mutation that stopped partway. Chunks already applied are not
/// rolled back; `succeeded_ids` records exactly which ids changed state, so
/// callers can reconcile by re-running the operation for the remainder.
#[derive(Debug)]
pub struct ChunkFailure {
    pub succeeded_ids: Vec<String>,
    pub failed_chunk: usize,
    pub cause: AppError,
}

/// Apply `operation` to consecutive groups of at most `chunk_size` ids,
/// strictly in order, stopping at the first failing group. Succeeded groups
/// stay applied. An empty id list is a no-op success.
///
/// Chunking keeps each store statement under the backend's own timeout; the
/// price is that a failure leaves a prefix applied, which callers must
/// tolerate (see `ChunkFailure`).
pub async fn apply_in_chunks<F, Fut>(
    ids: &[String],
    chunk_size: usize,
    mut operation: F,
) -> Result<usize, ChunkFailure>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<u64, AppError>>,
{
    if ids.is_empty() {
        return Ok(0);
    }
    let size = chunk_size.max(1);
    let mut succeeded: Vec<String> = Vec::with_capacity(ids.len());

    for (index, group) in ids.chunks(size).enumerate() {
        match operation(group.to_vec()).await {
            Ok(_) => succeeded.extend_from_slice(group),
            Err(cause) => {
                return Err(ChunkFailure {
                    succeeded_ids: succeeded,
                    failed_chunk: index,
                    cause,
                })
            }
        }
    }

    Ok(succeeded.len())
}

/// The concrete mutator: one id-scoped UPDATE per chunk against `table`.
pub async fn update_ids_in_chunks(
    pool: &PgPool,
    table: &'static str,
    ids: &[String],
    patch: &Map<String, Value>,
    chunk_size: usize,
) -> Result<usize, ChunkFailure> {
    apply_in_chunks(ids, chunk_size, |group| {
        let patch = patch.clone();
        async move { update_rows_by_ids(pool, table, &group, &patch).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::apply_in_chunks;
    use crate::error::AppError;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id-{i}")).collect()
    }

    #[tokio::test]
    async fn empty_list_is_a_noop_success() {
        let calls = AtomicUsize::new(0);
        let applied = apply_in_chunks(&[], 5, |_group| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await
        .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn splits_into_bounded_groups() {
        let all = ids(12);
        let mut seen: Vec<Vec<String>> = Vec::new();
        let applied = apply_in_chunks(&all, 5, |group| {
            seen.push(group.clone());
            async move { Ok(group.len() as u64) }
        })
        .await
        .unwrap();

        assert_eq!(applied, 12);
        assert_eq!(
            seen.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![5, 5, 2]
        );
        let flattened: Vec<String> = seen.into_iter().flatten().collect();
        assert_eq!(flattened, all);
    }

    #[tokio::test]
    async fn stops_at_first_failing_chunk() {
        let all = ids(11);
        let calls = AtomicUsize::new(0);
        let failure = apply_in_chunks(&all, 4, |group| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 2 {
                    Err(AppError::Dependency("store timeout".to_string()))
                } else {
                    Ok(group.len() as u64)
                }
            }
        })
        .await
        .unwrap_err();

        // two full chunks of 4 applied, third failed, nothing past it ran
        assert_eq!(failure.succeeded_ids, all[..8].to_vec());
        assert_eq!(failure.failed_chunk, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_on_first_chunk_applies_nothing() {
        let all = ids(3);
        let failure = apply_in_chunks(&all, 5, |_group| async {
            Err(AppError::Dependency("down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(failure.succeeded_ids.is_empty());
        assert_eq!(failure.failed_chunk, 0);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_clamped() {
        let all = ids(2);
        let applied = apply_in_chunks(&all, 0, |group| async move { Ok(group.len() as u64) })
            .await
            .unwrap();
        assert_eq!(applied, 2);
    }
}
