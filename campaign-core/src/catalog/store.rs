//! Loads a campaign catalog database into the in-memory graph of
//! [`super::model`] and extracts blob payloads to disk (§4.1).

use std::io::{Read, Write};
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key as AeadKey, XChaCha20Poly1305, XNonce};
use rusqlite::Connection;

use crate::error::CatalogError;

use super::model::{BlobFile, CatalogData, CatalogVersion, Dataset, Host, Key};

/// The lowest catalog schema version this store understands. Anything older
/// is rejected with `CatalogSchemaMismatch` rather than guessed at (§9 open
/// question: "behavior when version is unsupported is unspecified in the
/// source").
const MIN_SUPPORTED_VERSION: (i32, i32, i32) = (2, 0, 0);

/// Stateless entry point: reads a catalog database and extracts its blobs.
///
/// Holds no state itself -- every call opens (and closes) its own sqlite
/// connection, matching the source's one-`sqlite3_open`-per-`Open` lifetime.
pub struct CatalogStore;

impl CatalogStore {
    /// Loads a catalog database at `path` into a validated [`CatalogData`].
    ///
    /// Fails with [`CatalogError::Unreadable`] if the file cannot be opened,
    /// or [`CatalogError::SchemaMismatch`] if a required table is missing or
    /// the catalog version predates [`MIN_SUPPORTED_VERSION`].
    pub fn load(path: &Path) -> Result<CatalogData, CatalogError> {
        let conn = Connection::open(path).map_err(|source| CatalogError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let version = Self::read_version(&conn)?;
        if let Some(v) = &version {
            let parsed = (v.major, v.minor, v.micro);
            if parsed < MIN_SUPPORTED_VERSION {
                return Err(CatalogError::SchemaMismatch(format!(
                    "catalog version {} is older than the minimum supported {:?}",
                    v.version_str, MIN_SUPPORTED_VERSION
                )));
            }
        }

        let directories = Self::read_directories(&conn)?;
        let hosts = Self::read_hosts(&conn, directories.len())?;
        let keys = Self::read_keys(&conn)?;
        let datasets = Self::read_datasets(&conn)?;

        let data = CatalogData {
            version,
            hosts,
            keys,
            directories,
            datasets,
        };
        data.validate()?;
        Ok(data)
    }

    fn read_version(conn: &Connection) -> Result<Option<CatalogVersion>, CatalogError> {
        let mut stmt = match conn.prepare("SELECT major, minor, micro FROM version ORDER BY id") {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let row = stmt
            .query_row([], |row| {
                let major: i32 = row.get(0)?;
                let minor: i32 = row.get(1)?;
                let micro: i32 = row.get(2)?;
                Ok((major, minor, micro))
            })
            .map_err(|e| {
                CatalogError::SchemaMismatch(format!("cannot read version table: {e}"))
            })?;
        Ok(Some(CatalogVersion {
            version_str: format!("{}.{}.{}", row.0, row.1, row.2),
            major: row.0,
            minor: row.1,
            micro: row.2,
        }))
    }

    fn read_directories(conn: &Connection) -> Result<Vec<String>, CatalogError> {
        let mut stmt = conn
            .prepare("SELECT name FROM directory ORDER BY id")
            .map_err(|e| CatalogError::SchemaMismatch(format!("missing directory table: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))
    }

    fn read_hosts(conn: &Connection, num_dirs: usize) -> Result<Vec<Host>, CatalogError> {
        let mut stmt = conn
            .prepare("SELECT id, hostname, longhostname FROM host ORDER BY id")
            .map_err(|e| CatalogError::SchemaMismatch(format!("missing host table: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let hostname: String = row.get(1)?;
                let longhostname: String = row.get(2)?;
                Ok((id, hostname, longhostname))
            })
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;

        let mut dirs_by_host = std::collections::HashMap::<i64, Vec<usize>>::new();
        {
            let mut stmt = conn
                .prepare("SELECT host_id, dir_id FROM host_directory ORDER BY host_id, dir_id")
                .map_err(|e| {
                    CatalogError::SchemaMismatch(format!("missing host_directory table: {e}"))
                })?;
            let joined = stmt
                .query_map([], |row| {
                    let host_id: i64 = row.get(0)?;
                    let dir_id: i64 = row.get(1)?;
                    Ok((host_id, dir_id))
                })
                .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
            for pair in joined {
                let (host_id, dir_id) = pair.map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
                let dir_idx = dir_id as usize;
                if dir_idx >= num_dirs {
                    return Err(CatalogError::SchemaMismatch(format!(
                        "host_directory references unknown dir id {dir_id}"
                    )));
                }
                dirs_by_host.entry(host_id).or_default().push(dir_idx);
            }
        }

        Ok(rows
            .into_iter()
            .map(|(id, shortname, fqdn)| Host {
                shortname,
                fqdn,
                dir_indices: dirs_by_host.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    fn read_keys(conn: &Connection) -> Result<Vec<Key>, CatalogError> {
        let mut stmt = match conn.prepare("SELECT id, keyHex FROM key ORDER BY id") {
            Ok(s) => s,
            // A catalog with no protected datasets may not carry a key table.
            Err(_) => return Ok(Vec::new()),
        };
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let hex: Option<String> = row.get(1)?;
                Ok(Key {
                    id,
                    key_material: hex.and_then(|h| hex::decode(h).ok()),
                })
            })
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))
    }

    fn read_datasets(
        conn: &Connection,
    ) -> Result<std::collections::BTreeMap<usize, Dataset>, CatalogError> {
        let mut stmt = conn
            .prepare("SELECT id, uuid, name, host_id, dir_id, key_id FROM dataset ORDER BY id")
            .map_err(|e| CatalogError::SchemaMismatch(format!("missing dataset table: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let uuid: String = row.get(1)?;
                let name: String = row.get(2)?;
                let host_id: i64 = row.get(3)?;
                let dir_id: i64 = row.get(4)?;
                let key_id: Option<i64> = row.get(5)?;
                Ok((id, uuid, name, host_id, dir_id, key_id))
            })
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;

        let uuids_by_id: std::collections::HashMap<i64, String> = rows
            .iter()
            .map(|(id, uuid, ..)| (*id, uuid.clone()))
            .collect();

        let mut files_by_dataset = std::collections::HashMap::<i64, Vec<BlobFile>>::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT dataset_id, name, compressed, length_original, length_compressed, ctime \
                     FROM file ORDER BY dataset_id, id",
                )
                .map_err(|e| CatalogError::SchemaMismatch(format!("missing file table: {e}")))?;
            let joined = stmt
                .query_map([], |row| {
                    let dataset_id: i64 = row.get(0)?;
                    Ok((
                        dataset_id,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? != 0,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
            for row in joined {
                let (dataset_id, name, compressed, length_original, length_compressed, ctime) =
                    row.map_err(|e| CatalogError::SchemaMismatch(e.to_string()))?;
                let dataset_uuid = uuids_by_id.get(&dataset_id).cloned().ok_or_else(|| {
                    CatalogError::SchemaMismatch(format!(
                        "file row references unknown dataset id {dataset_id}"
                    ))
                })?;
                files_by_dataset.entry(dataset_id).or_default().push(BlobFile {
                    dataset_uuid,
                    name,
                    compressed,
                    length_original,
                    length_compressed,
                    ctime,
                });
            }
        }

        let mut out = std::collections::BTreeMap::new();
        for (id, uuid, name, host_id, dir_id, key_id) in rows {
            out.insert(
                id as usize,
                Dataset {
                    uuid,
                    name,
                    host_idx: host_id as usize,
                    dir_idx: dir_id as usize,
                    key_idx: key_id.map(|k| k as usize),
                    files: files_by_dataset.remove(&id).unwrap_or_default(),
                },
            );
        }
        Ok(out)
    }

    /// Writes the payload bytes of `blob` to `output_path`, transparently
    /// decompressing and/or decrypting.
    ///
    /// `key_hex` is empty when the blob is unprotected. When non-empty it is
    /// expected to be valid hex-encoded key material already fetched from
    /// the key service; a wrong or garbled key surfaces as
    /// [`CatalogError::BlobDecryptionFailed`].
    pub fn extract_blob(
        path: &Path,
        output_path: &Path,
        blob: &BlobFile,
        key_hex: Option<&str>,
    ) -> Result<(), CatalogError> {
        let conn = Connection::open(path).map_err(|source| CatalogError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        // Scoped by the owning dataset's uuid, not `name` alone: file names
        // are only unique within a dataset, and two datasets can share a
        // generically-named container file (e.g. "data.0").
        let raw: Vec<u8> = conn
            .query_row(
                "SELECT file.payload FROM file \
                 JOIN dataset ON file.dataset_id = dataset.id \
                 WHERE dataset.uuid = ?1 AND file.name = ?2",
                rusqlite::params![blob.dataset_uuid, blob.name],
                |row| row.get(0),
            )
            .map_err(|_| {
                CatalogError::SchemaMismatch(format!(
                    "no payload row for blob {} in dataset {}",
                    blob.name, blob.dataset_uuid
                ))
            })?;

        let decrypted = match key_hex {
            Some(hex_key) if !hex_key.is_empty() => {
                Self::decrypt(&blob.name, &raw, hex_key)?
            }
            _ => raw,
        };

        let plain = if blob.compressed {
            Self::inflate(&blob.name, &decrypted)?
        } else {
            decrypted
        };

        if plain.len() as u64 != blob.length_original {
            return Err(CatalogError::SizeMismatch {
                name: blob.name.clone(),
                expected: blob.length_original,
                actual: plain.len() as u64,
            });
        }

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
                name: blob.name.clone(),
                path: output_path.to_path_buf(),
                source,
            })?;
        }
        let mut f = std::fs::File::create(output_path).map_err(|source| CatalogError::Io {
            name: blob.name.clone(),
            path: output_path.to_path_buf(),
            source,
        })?;
        f.write_all(&plain).map_err(|source| CatalogError::Io {
            name: blob.name.clone(),
            path: output_path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn inflate(name: &str, data: &[u8]) -> Result<Vec<u8>, CatalogError> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|source| CatalogError::Io {
            name: name.to_string(),
            path: std::path::PathBuf::new(),
            source,
        })?;
        Ok(out)
    }

    /// The first 24 bytes of the ciphertext are the XChaCha20-Poly1305
    /// nonce; the remainder is the sealed box, matching how
    /// `encrypt_blob` (test helper) lays it out.
    fn decrypt(name: &str, data: &[u8], key_hex: &str) -> Result<Vec<u8>, CatalogError> {
        let key_bytes = hex::decode(key_hex).map_err(|_| CatalogError::BlobDecryptionFailed {
            name: name.to_string(),
            source: chacha20poly1305::aead::Error,
        })?;
        if key_bytes.len() != 32 || data.len() < 24 {
            return Err(CatalogError::BlobDecryptionFailed {
                name: name.to_string(),
                source: chacha20poly1305::aead::Error,
            });
        }
        let cipher = XChaCha20Poly1305::new(AeadKey::from_slice(&key_bytes));
        let (nonce, ciphertext) = data.split_at(24);
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|source| CatalogError::BlobDecryptionFailed {
                name: name.to_string(),
                source,
            })
    }

    /// Writes `data` into a fresh sqlite database at `path` using the §6
    /// schema, for tests elsewhere in the crate that need a real catalog
    /// file to round-trip through [`Self::load`].
    #[cfg(test)]
    pub(crate) fn write_for_test(path: &Path, data: &CatalogData) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE version(id INTEGER PRIMARY KEY, major INT, minor INT, micro INT);
             CREATE TABLE host(id INTEGER PRIMARY KEY, hostname TEXT, longhostname TEXT);
             CREATE TABLE directory(id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE host_directory(host_id INT, dir_id INT);
             CREATE TABLE key(id TEXT PRIMARY KEY, keyHex TEXT);
             CREATE TABLE dataset(id INTEGER PRIMARY KEY, uuid TEXT, name TEXT, host_id INT, dir_id INT, key_id INT);
             CREATE TABLE file(id INTEGER PRIMARY KEY, dataset_id INT, name TEXT, compressed INT, \
                 length_original INT, length_compressed INT, ctime INT, payload BLOB);",
        )
        .unwrap();

        if let Some(v) = &data.version {
            conn.execute(
                "INSERT INTO version VALUES (0, ?1, ?2, ?3)",
                rusqlite::params![v.major, v.minor, v.micro],
            )
            .unwrap();
        } else {
            conn.execute("INSERT INTO version VALUES (0, 2, 9, 1)", [])
                .unwrap();
        }

        for (idx, dir) in data.directories.iter().enumerate() {
            conn.execute(
                "INSERT INTO directory VALUES (?1, ?2)",
                rusqlite::params![idx as i64, dir],
            )
            .unwrap();
        }

        for (idx, host) in data.hosts.iter().enumerate() {
            conn.execute(
                "INSERT INTO host VALUES (?1, ?2, ?3)",
                rusqlite::params![idx as i64, host.shortname, host.fqdn],
            )
            .unwrap();
            for dir_idx in &host.dir_indices {
                conn.execute(
                    "INSERT INTO host_directory VALUES (?1, ?2)",
                    rusqlite::params![idx as i64, *dir_idx as i64],
                )
                .unwrap();
            }
        }

        for key in &data.keys {
            let hex = key.key_material.as_ref().map(hex::encode);
            conn.execute(
                "INSERT INTO key VALUES (?1, ?2)",
                rusqlite::params![key.id, hex],
            )
            .unwrap();
        }

        for (id, ds) in &data.datasets {
            conn.execute(
                "INSERT INTO dataset VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    *id as i64,
                    ds.uuid,
                    ds.name,
                    ds.host_idx as i64,
                    ds.dir_idx as i64,
                    ds.key_idx.map(|k| k as i64),
                ],
            )
            .unwrap();
            for (file_id, file) in ds.files.iter().enumerate() {
                conn.execute(
                    "INSERT INTO file VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        file_id as i64,
                        *id as i64,
                        file.name,
                        file.compressed as i64,
                        file.length_original as i64,
                        file.length_compressed as i64,
                        file.ctime,
                        Vec::<u8>::new(),
                    ],
                )
                .unwrap();
            }
        }
    }

    /// Test/tooling helper mirroring [`Self::decrypt`]'s layout, used to
    /// prepare fixture catalogs with protected blobs.
    #[cfg(test)]
    pub(crate) fn encrypt_for_test(data: &[u8], key_hex: &str) -> Vec<u8> {
        use chacha20poly1305::aead::OsRng;
        use chacha20poly1305::AeadCore;

        let key_bytes = hex::decode(key_hex).unwrap();
        let cipher = XChaCha20Poly1305::new(AeadKey::from_slice(&key_bytes));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, data).unwrap();
        [nonce.as_slice(), &ciphertext[..]].concat()
    }
}
