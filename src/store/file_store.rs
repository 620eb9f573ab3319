//! C3 FileStore — atomic JSON/YAML read/write (temp+rename), rooted under a configured data
//! directory (§4.3). Callers must not assume cross-file atomicity.

use crate::error::{CoreError, CoreResult};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn read_json<T: DeserializeOwned>(&self, rel: &str, default: T) -> CoreResult<T> {
        let path = self.resolve(rel);
        if !path.exists() {
            return Ok(default);
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(CoreError::from)
    }

    pub fn write_json<T: Serialize>(&self, rel: &str, data: &T) -> CoreResult<()> {
        let text = serde_json::to_string_pretty(data)?;
        self.atomic_write(rel, text.as_bytes())
    }

    pub fn read_yaml<T: DeserializeOwned>(&self, rel: &str, default: T) -> CoreResult<T> {
        let path = self.resolve(rel);
        if !path.exists() {
            return Ok(default);
        }
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text).map_err(CoreError::from)
    }

    pub fn write_yaml<T: Serialize>(&self, rel: &str, data: &T) -> CoreResult<()> {
        let text = serde_yaml::to_string(data)?;
        self.atomic_write(rel, text.as_bytes())
    }

    /// Write-to-temp, fsync, rename-over-target (§4.3). The temp file lives alongside the
    /// target so the rename stays within one filesystem.
    fn atomic_write(&self, rel: &str, bytes: &[u8]) -> CoreResult<()> {
        let target = self.resolve(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parent = target.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| CoreError::StorageIo(e.to_string()))?;
        Ok(())
    }

    /// Reads a file's raw text, or `None` if it doesn't exist — for callers (e.g. backups) that
    /// need to carry the on-disk bytes through verbatim rather than deserializing them.
    pub fn read_to_string(&self, rel: &str) -> CoreResult<Option<String>> {
        let path = self.resolve(rel);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    /// Lists every plain file directly under `dir` (non-recursive), as `dir/name` paths.
    pub fn list_dir(&self, dir: &str) -> CoreResult<Vec<String>> {
        let path = self.root.join(dir);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(format!("{dir}/{}", entry.file_name().to_string_lossy()));
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn list_files(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let dir = self.resolve_dir_for_prefix(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let rel = Self::rel_name(prefix, &name);
            if rel.starts_with(prefix) {
                out.push(rel);
            }
        }
        out.sort();
        Ok(out)
    }

    fn resolve_dir_for_prefix(&self, prefix: &str) -> PathBuf {
        match Path::new(prefix).parent() {
            Some(p) if !p.as_os_str().is_empty() => self.root.join(p),
            _ => self.root.clone(),
        }
    }

    fn rel_name(prefix: &str, file_name: &str) -> String {
        match Path::new(prefix).parent() {
            Some(p) if !p.as_os_str().is_empty() => p.join(file_name).to_string_lossy().to_string(),
            _ => file_name.to_string(),
        }
    }

    pub fn delete_file(&self, rel: &str) -> CoreResult<()> {
        let path = self.resolve(rel);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn rename(&self, src: &str, dst: &str) -> CoreResult<()> {
        let src_path = self.resolve(src);
        let dst_path = self.resolve(dst);
        if let Some(parent) = dst_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(src_path, dst_path)?;
        Ok(())
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct Sample {
        value: i32,
    }

    #[test]
    fn write_then_read_json_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.write_json("players/p1.json", &Sample { value: 7 }).unwrap();
        let read: Sample = store.read_json("players/p1.json", Sample::default()).unwrap();
        assert_eq!(read, Sample { value: 7 });
    }

    #[test]
    fn missing_file_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        let read: Sample = store.read_json("nope.json", Sample { value: 99 }).unwrap();
        assert_eq!(read, Sample { value: 99 });
    }

    #[test]
    fn yaml_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.write_yaml("players/p1.yaml", &Sample { value: 3 }).unwrap();
        let read: Sample = store.read_yaml("players/p1.yaml", Sample::default()).unwrap();
        assert_eq!(read, Sample { value: 3 });
    }

    #[test]
    fn list_files_filters_by_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.write_json("backups/farm_backup_a.json", &Sample::default()).unwrap();
        store.write_json("backups/farm_backup_b.json", &Sample::default()).unwrap();
        store.write_json("backups/other.json", &Sample::default()).unwrap();
        let files = store.list_files("backups/farm_backup_").unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn no_temp_file_left_behind_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.write_json("x.json", &Sample { value: 1 }).unwrap();
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
