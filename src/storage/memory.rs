//! An array store held in process memory.

use std::{
    collections::HashMap,
    path::Path,
    sync::RwLock,
};

use anyhow::anyhow;

use crate::storage::{ArrayStore, Dataset, DatasetExists, StorageResult};

#[derive(Debug, Default)]
/// An [`ArrayStore`] that keeps everything in memory. Its content is lost with the process.
pub struct MemoryArrayStore {
    datasets: RwLock<HashMap<String, Dataset>>,
    attrs: RwLock<HashMap<String, u64>>,
}

impl MemoryArrayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArrayStore for MemoryArrayStore {
    fn read(&self, key: &str) -> StorageResult<Option<Dataset>> {
        let datasets = self.datasets.read().map_err(|_| poisoned())?;
        Ok(datasets.get(key).cloned())
    }

    fn write_or_replace(&self, key: &str, data: Dataset) -> StorageResult<()> {
        let mut datasets = self.datasets.write().map_err(|_| poisoned())?;
        datasets.insert(key.to_string(), data);
        Ok(())
    }

    fn create_once(&self, key: &str, data: Dataset) -> StorageResult<()> {
        let mut datasets = self.datasets.write().map_err(|_| poisoned())?;
        if datasets.contains_key(key) {
            return Err(DatasetExists(key.to_string()).into());
        }
        datasets.insert(key.to_string(), data);
        Ok(())
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        let datasets = self.datasets.read().map_err(|_| poisoned())?;
        Ok(datasets.contains_key(key))
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let datasets = self.datasets.read().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = datasets.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn attr(&self, name: &str) -> StorageResult<Option<u64>> {
        let attrs = self.attrs.read().map_err(|_| poisoned())?;
        Ok(attrs.get(name).copied())
    }

    fn set_attr(&self, name: &str, value: u64) -> StorageResult<()> {
        let mut attrs = self.attrs.write().map_err(|_| poisoned())?;
        attrs.insert(name.to_string(), value);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        self.datasets.write().map_err(|_| poisoned())?.clear();
        self.attrs.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("memory store lock poisoned")
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_create_once_refuses_existing_key() {
        let store = MemoryArrayStore::new();
        store
            .create_once("1/var", Dataset::F64(array![0.5]))
            .unwrap();
        let err = store
            .create_once("1/var", Dataset::F64(array![0.1]))
            .unwrap_err();
        assert!(err.downcast_ref::<DatasetExists>().is_some());
        assert_eq!(
            store.read("1/var").unwrap(),
            Some(Dataset::F64(array![0.5]))
        );
    }

    #[test]
    fn test_write_or_replace_and_attrs() {
        let store = MemoryArrayStore::new();
        assert_eq!(store.read("1/positions").unwrap(), None);
        store
            .write_or_replace("1/positions", Dataset::U32(array![1, 2]))
            .unwrap();
        store
            .write_or_replace("1/positions", Dataset::U32(array![3]))
            .unwrap();
        assert_eq!(
            store.read("1/positions").unwrap(),
            Some(Dataset::U32(array![3]))
        );

        assert_eq!(store.attr("N").unwrap(), None);
        store.set_attr("N", 30).unwrap();
        assert_eq!(store.attr("N").unwrap(), Some(30));

        store
            .write_or_replace("1/counts", Dataset::I64(ndarray::array![[1, 0, 0, 0]]))
            .unwrap();
        assert_eq!(store.keys().unwrap(), vec!["1/counts", "1/positions"]);

        store.clear().unwrap();
        assert!(!store.contains("1/positions").unwrap());
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(store.attr("N").unwrap(), None);
    }
}
