//! Deterministic local paths for remote datasets and their metadata blobs
//! (§4.3). Creates directories and writes files on demand; implements no
//! eviction policy -- a separate cache manager is assumed to enforce bounds
//! out of band.

use std::path::{Path, PathBuf};

use crate::catalog::{CatalogStore, Dataset};
use crate::error::CacheError;

/// Resolves and populates the local cache directory for one remote dataset.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<cacheRoot>/<uuid-prefix-3>/<uuid>`.
    pub fn dataset_dir(&self, uuid: &str) -> PathBuf {
        let prefix: String = uuid.chars().take(3).collect();
        self.root.join(prefix).join(uuid)
    }

    /// `<cacheRoot>/<host>/<campaign>`, used for the S3-backed branch of the
    /// sub-engine factory (§4.6), which has its own cache convention because
    /// the object-storage transport caches at the container level rather
    /// than the blob level.
    pub fn s3_cache_dir(&self, host: &str, campaign_name: &str) -> PathBuf {
        self.root.join(host).join(campaign_name)
    }

    /// Materializes every catalog blob for `dataset` into its cache
    /// directory, decrypting with `key_hex` if given, then (re)writes
    /// `info.txt`. Returns the dataset's cache directory on success.
    pub fn materialize(
        &self,
        catalog_path: &Path,
        dataset: &Dataset,
        key_hex: Option<&str>,
        campaign_name: &str,
        remote_host: &str,
        remote_path: &str,
    ) -> Result<PathBuf, crate::error::EngineError> {
        let dir = self.dataset_dir(&dataset.uuid);
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        for file in &dataset.files {
            let out = dir.join(&file.name);
            CatalogStore::extract_blob(catalog_path, &out, file, key_hex)?;
        }

        self.write_info(&dir, campaign_name, &dataset.name, remote_host, remote_path)?;
        Ok(dir)
    }

    /// `info.txt` must be overwritten on every open (§4.3).
    fn write_info(
        &self,
        dir: &Path,
        campaign_name: &str,
        dataset_name: &str,
        remote_host: &str,
        remote_path: &str,
    ) -> Result<(), CacheError> {
        let info_path = dir.join("info.txt");
        let contents = format!(
            "Campaign = {campaign_name}\nDataset = {dataset_name}\nRemoteHost = {remote_host}\nRemoteDataPath = {remote_path}\n"
        );
        std::fs::write(&info_path, contents).map_err(|source| CacheError::WriteFile {
            path: info_path,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_dir_uses_three_char_prefix() {
        let layout = CacheLayout::new("/cache/root");
        let dir = layout.dataset_dir("abcdef12-3456-7890");
        assert_eq!(dir, Path::new("/cache/root/abc/abcdef12-3456-7890"));
    }

    #[test]
    fn dataset_dir_handles_short_uuid() {
        let layout = CacheLayout::new("/cache/root");
        let dir = layout.dataset_dir("ab");
        assert_eq!(dir, Path::new("/cache/root/ab/ab"));
    }

    #[test]
    fn materialize_overwrites_info_txt() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(tmp.path());
        let dataset = Dataset {
            uuid: "uuid-1".into(),
            name: "sim.bp".into(),
            host_idx: 0,
            dir_idx: 0,
            key_idx: None,
            files: vec![],
        };
        let catalog_path = tmp.path().join("unused.db");
        let dir = layout
            .materialize(&catalog_path, &dataset, None, "camp1", "remote1", "/data/sim.bp")
            .unwrap();
        let info = std::fs::read_to_string(dir.join("info.txt")).unwrap();
        assert!(info.contains("Campaign = camp1"));
        assert!(info.contains("RemoteHost = remote1"));

        // A second materialize with different metadata must replace, not
        // append to, info.txt.
        let dir2 = layout
            .materialize(&catalog_path, &dataset, None, "camp2", "remote2", "/data/sim.bp")
            .unwrap();
        let info2 = std::fs::read_to_string(dir2.join("info.txt")).unwrap();
        assert!(info2.contains("Campaign = camp2"));
        assert!(!info2.contains("camp1"));
    }
}
