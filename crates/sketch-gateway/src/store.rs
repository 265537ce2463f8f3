use std::sync::Arc;

use tracing::error;

use sketch_db::Database;
use sketch_types::{SketchError, SketchResult};

pub type Store = Arc<Database>;

/// Run a store call off the async runtime.
///
/// Store failures surface as `TransientStore`; they are logged here and never retried.
pub async fn blocking<F, T>(store: &Store, f: F) -> SketchResult<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = store.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            SketchError::store(e)
        })?
        .map_err(|e| {
            error!("Store error: {:#}", e);
            SketchError::store(e)
        })
}
