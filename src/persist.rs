//! Atomic key/value snapshot to disk.
//!
//! `Persist` is a typed tree of JSON values serialized to a single file.
//! Paths are dot-separated (`"message-store.next-seq"`); intermediate nodes
//! are created on demand. There is exactly one owner per file and no
//! internal locking; concurrent access must be serialized by the caller,
//! same as the rest of the broker's single-threaded component state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Dot-path JSON tree persisted atomically to a file.
#[derive(Debug)]
pub struct Persist {
    path: PathBuf,
    root: Value,
}

impl Persist {
    /// Loads the tree from `path`, falling back to a `.old` sibling on parse
    /// failure, and to an empty tree if both are unreadable or missing.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let root = Self::read_file(&path)
            .or_else(|| Self::read_file(&Self::old_path(&path)))
            .unwrap_or_else(|| {
                log::warn!("persisted state at {} unreadable; starting empty", path.display());
                Value::Object(serde_json::Map::new())
            });
        Self { path, root }
    }

    fn read_file(path: &Path) -> Option<Value> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(v) => Some(v),
            Err(e) => {
                log::error!("failed to parse {}: {e}", path.display());
                None
            }
        }
    }

    fn old_path(path: &Path) -> PathBuf {
        let mut old = path.as_os_str().to_owned();
        old.push(".old");
        PathBuf::from(old)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Reads a typed value at `path`, or `None` if absent or the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let value = self.navigate(path)?;
        serde_json::from_value(value.clone()).ok()
    }

    fn navigate(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.split('.') {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    /// Writes `value` at `path`, creating intermediate object nodes as needed.
    pub fn set<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value)?;
        let segments: Vec<&str> = path.split('.').collect();
        let mut node = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            if !node.is_object() {
                *node = Value::Object(serde_json::Map::new());
            }
            node = node
                .as_object_mut()
                .expect("just ensured object")
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let last = segments.last().expect("split always yields at least one segment");
        node.as_object_mut()
            .expect("just ensured object")
            .insert((*last).to_string(), json);
        Ok(())
    }

    /// Removes the value at `path`, if present.
    pub fn remove(&mut self, path: &str) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut node = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let Some(obj) = node.as_object_mut() else { return };
            let Some(next) = obj.get_mut(*segment) else { return };
            node = next;
        }
        if let Some(obj) = node.as_object_mut() {
            obj.remove(*segments.last().expect("non-empty path"));
        }
    }

    /// Atomically writes the current tree: the old file (if any) is copied
    /// aside to `.old`, the new content is written to `.tmp`, then renamed
    /// over the target so a crash never observes a torn file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            fs::copy(&self.path, Self::old_path(&self.path))?;
        }
        let tmp = Self::tmp_path(&self.path);
        fs::write(&tmp, serde_json::to_string_pretty(&self.root)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
