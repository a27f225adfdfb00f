//! Storage API.

use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// A named multi-dimensional array. The variant carries the element type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Dataset {
    U32(Array1<u32>),
    I64(Array2<i64>),
    F64(Array1<f64>),
    Bool(Array1<bool>),
}

/// Error returned by [`ArrayStore::create_once`] when the key is taken.
#[derive(Debug, Error)]
#[error("dataset {0} already exists")]
pub struct DatasetExists(pub String);

/// A durable key-value store of named arrays with numeric attributes.
///
/// Keys are `/`-separated paths such as `"1/counts"`.
pub trait ArrayStore
where
    Self: Send + Sync + 'static,
{
    /// Returns the dataset stored under `key`.
    ///
    /// # Behavior
    ///
    /// - If the key does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the key exists, return `StorageResult::Ok(Some(Dataset))`.
    fn read(&self, key: &str) -> StorageResult<Option<Dataset>>;

    /// Stores `data` under `key`, overriding any previous dataset.
    fn write_or_replace(&self, key: &str, data: Dataset) -> StorageResult<()>;

    /// Stores `data` under `key`.
    ///
    /// # Behavior
    ///
    /// - If the key does not exist yet, store the dataset and return `StorageResult::Ok(())`.
    /// - If the key exists, leave it untouched and fail with [`DatasetExists`].
    fn create_once(&self, key: &str, data: Dataset) -> StorageResult<()>;

    /// Whether a dataset is stored under `key`.
    fn contains(&self, key: &str) -> StorageResult<bool>;

    /// Returns the keys of all the stored datasets, sorted.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Returns the attribute `name` of the store.
    fn attr(&self, name: &str) -> StorageResult<Option<u64>>;

    /// Sets the attribute `name` of the store.
    fn set_attr(&self, name: &str, value: u64) -> StorageResult<()>;

    /// Deletes all datasets and attributes.
    fn clear(&self) -> StorageResult<()>;

    /// The location of the store on disk, if any.
    fn path(&self) -> Option<&Path>;
}
