//! In-memory representation of a loaded campaign catalog (§3).
//!
//! Everything here is built once by [`crate::catalog::CatalogStore::load`]
//! and is read-only afterward: no component mutates a `CatalogData` once
//! `Open` has returned it to the `FederatedEngine`.

/// `{versionStr, major, minor, micro, numericVersion}`.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogVersion {
    pub version_str: String,
    pub major: i32,
    pub minor: i32,
    pub micro: i32,
}

impl CatalogVersion {
    /// A single comparable number, e.g. 2.9.1 -> 2009001.
    pub fn numeric(&self) -> i64 {
        (self.major as i64) * 1_000_000 + (self.minor as i64) * 1_000 + (self.micro as i64)
    }
}

/// A host known to the catalog. The "local" host is resolved separately by
/// comparing `shortname`/`fqdn` against the caller's own hostname.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub shortname: String,
    pub fqdn: String,
    /// Indices into `CatalogData::directories`.
    pub dir_indices: Vec<usize>,
}

/// `{id, keyMaterial}`. `key_material` is `None` until fetched from the
/// key service; the sentinel value returned by the key service ("0") is
/// translated to `Denied` by the caller, not stored here.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub id: String,
    pub key_material: Option<Vec<u8>>,
}

/// One file of a dataset's on-disk container, as a row of the catalog's
/// blob table. `payload` is not read into memory until
/// [`crate::catalog::CatalogStore::extract_blob`] is called for this row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobFile {
    /// The owning dataset's uuid. File names are only unique *within* a
    /// dataset (enforced by [`CatalogData::validate`]), so extracting a blob
    /// must scope its lookup by this, not by `name` alone.
    pub dataset_uuid: String,
    pub name: String,
    pub compressed: bool,
    pub length_original: u64,
    pub length_compressed: u64,
    pub ctime: i64,
}

/// A named container owned by exactly one host, holding an ordered list of
/// blob files that make up its on-disk representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub uuid: String,
    pub name: String,
    pub host_idx: usize,
    pub dir_idx: usize,
    pub key_idx: Option<usize>,
    pub files: Vec<BlobFile>,
}

impl Dataset {
    pub fn has_key(&self) -> bool {
        self.key_idx.is_some()
    }
}

/// The root aggregate produced by [`crate::catalog::CatalogStore::load`].
///
/// Invariants (checked by [`CatalogData::validate`], enforced once at load
/// time so the rest of the engine never has to re-check them):
/// - every `Host.dir_indices[i]` is a valid index into `directories`
/// - every `Dataset.host_idx`/`dir_idx` is valid; if `has_key()`, `key_idx` is valid
/// - dataset uuids are unique; file names within one dataset are unique
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogData {
    pub version: Option<CatalogVersion>,
    pub hosts: Vec<Host>,
    pub keys: Vec<Key>,
    pub directories: Vec<String>,
    /// Keyed by the original catalog dataset id so the factory can report
    /// which row a skipped dataset came from.
    pub datasets: std::collections::BTreeMap<usize, Dataset>,
}

impl CatalogData {
    pub fn validate(&self) -> Result<(), crate::error::CatalogError> {
        use crate::error::CatalogError;

        for host in &self.hosts {
            for &dir_idx in &host.dir_indices {
                if dir_idx >= self.directories.len() {
                    return Err(CatalogError::SchemaMismatch(format!(
                        "host {} references unknown directory index {dir_idx}",
                        host.shortname
                    )));
                }
            }
        }

        let mut seen_uuids = std::collections::HashSet::new();
        for (idx, ds) in &self.datasets {
            if ds.host_idx >= self.hosts.len() {
                return Err(CatalogError::DanglingDatasetIndex(*idx));
            }
            if ds.dir_idx >= self.directories.len() {
                return Err(CatalogError::DanglingDatasetIndex(*idx));
            }
            if let Some(key_idx) = ds.key_idx {
                if key_idx >= self.keys.len() {
                    return Err(CatalogError::DanglingDatasetIndex(*idx));
                }
            }
            if !seen_uuids.insert(ds.uuid.clone()) {
                return Err(CatalogError::SchemaMismatch(format!(
                    "duplicate dataset uuid {}",
                    ds.uuid
                )));
            }
            let mut seen_files = std::collections::HashSet::new();
            for f in &ds.files {
                if !seen_files.insert(f.name.clone()) {
                    return Err(CatalogError::SchemaMismatch(format!(
                        "duplicate file name {} in dataset {}",
                        f.name, ds.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn host(&self, idx: usize) -> &Host {
        &self.hosts[idx]
    }

    pub fn directory(&self, idx: usize) -> &str {
        &self.directories[idx]
    }

    pub fn key(&self, idx: usize) -> &Key {
        &self.keys[idx]
    }
}
