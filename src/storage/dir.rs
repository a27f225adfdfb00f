//! An array store backed by a directory.
//!
//! Every dataset lives in its own bincode file: the key `1/counts` is stored at
//! `<root>/1/counts.bin`. Attributes share a single `attrs.bin` file.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Write},
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::storage::{ArrayStore, Dataset, DatasetExists, StorageResult};

const ATTRS_FILE: &str = "attrs.bin";

#[derive(Debug)]
/// An [`ArrayStore`] persisting datasets as files below a root directory.
pub struct DirArrayStore {
    root: PathBuf,
    // serializes the read-modify-write of the attributes file
    attrs: Mutex<()>,
}

impl DirArrayStore {
    /// Opens the store at `path`, creating the directory if needed.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store directory {}", root.display()))?;
        debug!("opened array store at {}", root.display());
        Ok(Self {
            root,
            attrs: Mutex::new(()),
        })
    }

    fn dataset_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(anyhow!("invalid dataset key {:?}", key));
        }
        let mut path = self.root.join(relative);
        path.set_extension("bin");
        Ok(path)
    }

    fn load_attrs(&self) -> StorageResult<HashMap<String, u64>> {
        match File::open(self.root.join(ATTRS_FILE)) {
            Ok(file) => Ok(bincode::deserialize_from(BufReader::new(file))?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_to<T: serde::Serialize>(file: File, data: &T) -> StorageResult<()> {
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, data)?;
    writer.flush()?;
    Ok(())
}

/// Collects the dataset keys below `dir`, skipping the attributes file of the root.
fn collect_keys(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> StorageResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if path.is_dir() {
            collect_keys(&path, &key, keys)?;
        } else if key != ATTRS_FILE {
            if let Some(key) = key.strip_suffix(".bin") {
                keys.push(key.to_string());
            }
        }
    }
    Ok(())
}

impl ArrayStore for DirArrayStore {
    fn read(&self, key: &str) -> StorageResult<Option<Dataset>> {
        let path = self.dataset_path(key)?;
        match File::open(&path) {
            Ok(file) => Ok(Some(bincode::deserialize_from(BufReader::new(file))?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn write_or_replace(&self, key: &str, data: Dataset) -> StorageResult<()> {
        let path = self.dataset_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        write_to(file, &data)
    }

    fn create_once(&self, key: &str, data: Dataset) -> StorageResult<()> {
        let path = self.dataset_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DatasetExists(key.to_string()).into())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", path.display()))
            }
        };
        write_to(file, &data)
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.dataset_path(key)?.is_file())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        collect_keys(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn attr(&self, name: &str) -> StorageResult<Option<u64>> {
        let _guard = self.attrs.lock().map_err(|_| anyhow!("attrs lock poisoned"))?;
        Ok(self.load_attrs()?.get(name).copied())
    }

    fn set_attr(&self, name: &str, value: u64) -> StorageResult<()> {
        let _guard = self.attrs.lock().map_err(|_| anyhow!("attrs lock poisoned"))?;
        let mut attrs = self.load_attrs()?;
        attrs.insert(name.to_string(), value);
        write_to(File::create(self.root.join(ATTRS_FILE))?, &attrs)
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self.attrs.lock().map_err(|_| anyhow!("attrs lock poisoned"))?;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
