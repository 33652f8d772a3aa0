use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

use super::StorageError;

/// Shared error source, so that a single failure can be handed to every waiter.
type SharedSource = Arc<dyn Error + Send + Sync + 'static>;

/// An error produced by [`Cache::get_and_load`](super::Cache::get_and_load).
///
/// The error is cheap to clone, as the result of one computation is fanned out to all the
/// callers that were waiting for it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The loader failed to produce a value.
    #[error("failed to load value for key `{key}`")]
    Load {
        key: String,
        #[source]
        source: SharedSource,
    },
    /// The value was loaded, but could not be written to the storage backend.
    #[error("failed to store value for key `{key}`")]
    Store {
        key: String,
        #[source]
        source: Arc<StorageError>,
    },
    /// The computation went away without producing a result, most likely because it panicked.
    #[error("computation for key `{key}` was interrupted")]
    Interrupted { key: String },
}

impl CacheError {
    pub(super) fn load(key: &str, source: crate::BoxError) -> Self {
        Self::Load {
            key: key.to_owned(),
            source: Arc::from(source),
        }
    }

    pub(super) fn store(key: &str, source: StorageError) -> Self {
        Self::Store {
            key: key.to_owned(),
            source: Arc::new(source),
        }
    }

    /// The key whose load failed.
    pub fn key(&self) -> &str {
        match self {
            Self::Load { key, .. } | Self::Store { key, .. } | Self::Interrupted { key } => key,
        }
    }
}

/// The outcome of a cache access.
pub type CacheEntry<T> = Result<T, CacheError>;
