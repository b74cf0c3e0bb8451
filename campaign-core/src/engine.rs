//! Public engine API: open, step lifecycle, read routing, close (§4.8).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::catalog::{CatalogData, CatalogStore};
use crate::error::EngineError;
use crate::factory::{Dispatch, Options, SubEngineFactory};
use crate::keyservice::{KeyFetchResult, KeyService};
use crate::namespace::{MergedVariable, NamespaceMerger, OwnedSubEngine};
use crate::process_group::ProcessGroup;
use crate::subengine::{
    AttributeInfo, BlockInfo, MinMax, ReadHandle, ReadMode, StepStatus, SubEngine, VariableInfo,
};

/// Opens the real sub-engine for one dataset once `SubEngineFactory` has
/// decided its `Dispatch`. The container-format/streaming engine itself is
/// out of scope (§1); this is the injection point a real deployment
/// implements against its own engine crate.
#[async_trait]
pub trait SubEngineOpener: Send + Sync {
    async fn open_dataset(
        &self,
        dispatch: &Dispatch,
        dataset: &crate::catalog::Dataset,
    ) -> Result<Arc<dyn SubEngine>, EngineError>;
}

/// A `SubEngineOpener` that serves pre-registered in-memory engines keyed by
/// dataset uuid, for tests and for standalone local-open deployments that
/// have already decoded their sub-engines elsewhere.
#[derive(Default)]
pub struct StaticSubEngineOpener {
    engines: std::collections::HashMap<String, Arc<dyn SubEngine>>,
}

impl StaticSubEngineOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uuid: impl Into<String>, engine: Arc<dyn SubEngine>) -> Self {
        self.engines.insert(uuid.into(), engine);
        self
    }
}

#[async_trait]
impl SubEngineOpener for StaticSubEngineOpener {
    async fn open_dataset(
        &self,
        _dispatch: &Dispatch,
        dataset: &crate::catalog::Dataset,
    ) -> Result<Arc<dyn SubEngine>, EngineError> {
        self.engines
            .get(&dataset.uuid)
            .cloned()
            .ok_or_else(|| EngineError::SubEngine(format!("no engine registered for dataset uuid {}", dataset.uuid)))
    }
}

/// The public federated-read engine: stitches a campaign catalog, a set of
/// opened sub-engines, and a merged namespace into one logical dataset.
pub struct FederatedEngine {
    catalog: CatalogData,
    engines: Vec<OwnedSubEngine>,
    namespace: NamespaceMerger,
    skipped: Vec<(String, String)>,
    current_step: u64,
    closed: bool,
}

impl FederatedEngine {
    /// Loads the catalog, dispatches every dataset, and builds the merged
    /// namespace. A dataset whose key is denied, whose dispatch fails, or
    /// whose sub-engine fails to open is logged and skipped; it never
    /// becomes fatal to `Open` (§4.6, §7).
    pub async fn open(
        catalog_path: impl Into<PathBuf>,
        options: &Options,
        key_service: &dyn KeyService,
        opener: &dyn SubEngineOpener,
        _process_group: &dyn ProcessGroup,
    ) -> Result<Self, EngineError> {
        options.validate()?;

        let catalog_path = catalog_path.into();
        let catalog = CatalogStore::load(&catalog_path)?;
        catalog.validate()?;

        let local_host = options
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let campaign_name = catalog_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "campaign".to_string());

        let factory = SubEngineFactory::new(options);
        let cache = factory.cache_layout().clone();

        let mut engines = Vec::new();
        let mut namespace = NamespaceMerger::new();
        let mut skipped = Vec::new();

        for dataset in catalog.datasets.values() {
            let key_hex = match Self::resolve_key(dataset, &catalog, key_service).await {
                Ok(hex) => hex,
                Err(reason) => {
                    warn!(dataset = %dataset.name, reason = %reason, "skipping dataset");
                    skipped.push((dataset.name.clone(), reason));
                    continue;
                }
            };

            let dispatch = match factory.resolve(dataset, &catalog, &local_host, &campaign_name, options) {
                Ok(d) => d,
                Err(e) => {
                    warn!(dataset = %dataset.name, reason = %e, "skipping dataset");
                    skipped.push((dataset.name.clone(), e.to_string()));
                    continue;
                }
            };

            if let Dispatch::Remote {
                ref remote_host,
                ref remote_path,
                ..
            } = dispatch
            {
                if let Err(e) = cache.materialize(
                    &catalog_path,
                    dataset,
                    key_hex.as_deref(),
                    &campaign_name,
                    remote_host,
                    remote_path,
                ) {
                    warn!(dataset = %dataset.name, reason = %e, "skipping dataset");
                    skipped.push((dataset.name.clone(), e.to_string()));
                    continue;
                }
            }

            let engine = match opener.open_dataset(&dispatch, dataset).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(dataset = %dataset.name, reason = %e, "skipping dataset");
                    skipped.push((dataset.name.clone(), e.to_string()));
                    continue;
                }
            };

            if let Err(e) = engine.open().await {
                warn!(dataset = %dataset.name, reason = %e, "skipping dataset");
                skipped.push((dataset.name.clone(), e.to_string()));
                continue;
            }

            namespace.import(&dataset.name, engines.len(), engine.as_ref()).await;
            engines.push(OwnedSubEngine {
                dataset_name: dataset.name.clone(),
                engine,
            });
        }

        Ok(Self {
            catalog,
            engines,
            namespace,
            skipped,
            current_step: 0,
            closed: false,
        })
    }

    async fn resolve_key(
        dataset: &crate::catalog::Dataset,
        catalog: &CatalogData,
        key_service: &dyn KeyService,
    ) -> Result<Option<String>, String> {
        let Some(key_idx) = dataset.key_idx else {
            return Ok(None);
        };
        let key = catalog.key(key_idx);
        if let Some(material) = &key.key_material {
            return Ok(Some(hex::encode(material)));
        }
        let key_id = key.id.clone();
        match key_service.fetch_key(&key_id).await {
            Ok(KeyFetchResult::Granted(hex)) => Ok(Some(hex)),
            Ok(KeyFetchResult::Denied) => Err(format!("key {key_id} denied")),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Datasets that failed to open, paired with the reason, in the order
    /// they were skipped. Lets tests assert skip behavior without scraping
    /// log output (§7).
    pub fn skipped_datasets(&self) -> &[(String, String)] {
        &self.skipped
    }

    pub fn catalog(&self) -> &CatalogData {
        &self.catalog
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.namespace.variable_names()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.namespace.attribute_names()
    }

    pub fn available_variables(&self) -> Vec<VariableInfo> {
        self.namespace
            .variable_names()
            .filter_map(|n| self.namespace.variable(n))
            .map(|v| v.info.clone())
            .collect()
    }

    pub fn available_attributes(&self) -> Vec<AttributeInfo> {
        self.namespace
            .attribute_names()
            .filter_map(|n| self.namespace.attribute(n))
            .map(|a| a.info.clone())
            .collect()
    }

    /// `BeginStep` (§4.8). Mirrors `CampaignReader::BeginStep`'s
    /// `++m_CurrentStep; if (m_CurrentStep == 2) return EndOfStream;`: the
    /// call that makes the counter reach 2 is the one that ends the stream,
    /// so there is exactly one `Ok` step before `EndOfStream` forever after.
    /// Per the §9 open-question decision recorded in DESIGN.md, a proper
    /// implementation would poll sub-engines for their own step status
    /// instead.
    pub fn begin_step(&mut self, _timeout: std::time::Duration) -> StepStatus {
        if self.closed {
            return StepStatus::OtherError;
        }
        self.current_step += 1;
        if self.current_step >= 2 {
            return StepStatus::EndOfStream;
        }
        StepStatus::Ok
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Fans `PerformGets` out to every open sub-engine concurrently -- each
    /// sub-engine's deferred reads are independent I/O, so there is no
    /// reason to serialize them. Per the §9 open question on partial
    /// fan-out failure, every sub-engine is always attempted; the first
    /// error (in engine order, not completion order) is returned and the
    /// rest are logged.
    pub async fn perform_gets(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        let results = futures::future::join_all(
            self.engines.iter().map(|owned| owned.engine.perform_gets()),
        )
        .await;

        let mut first_error = None;
        for (owned, result) in self.engines.iter().zip(results) {
            if let Err(e) = result {
                error!(dataset = %owned.dataset_name, error = %e, "perform_gets failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn end_step(&mut self) -> Result<(), EngineError> {
        self.perform_gets().await
    }

    fn resolve(&self, full_name: &str) -> Result<(&MergedVariable, &Arc<dyn SubEngine>), EngineError> {
        let merged = self
            .namespace
            .variable(full_name)
            .ok_or_else(|| EngineError::NameNotFound(full_name.to_string()))?;
        let owner = &self.engines[merged.owner_engine_idx].engine;
        Ok((merged, owner))
    }

    /// `Get(variable, data, Sync)` (§4.8): resolves the merged entry,
    /// forwards a synchronous read to the owning sub-engine, and copies the
    /// result into `dest` before returning.
    pub async fn get(&self, full_name: &str, dest: &mut [u8]) -> Result<(), EngineError> {
        let handle = self.get_handle(full_name, ReadMode::Sync).await?;
        let bytes = handle.wait().await?;
        let n = dest.len().min(bytes.len());
        dest[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// `Get(variable, data, Deferred)` (§4.8): resolves the merged entry and
    /// registers the read with the owning sub-engine, returning a handle
    /// rather than writing into a buffer. A borrowed `&mut [u8]` cannot
    /// survive until `perform_gets`/`end_step` actually flush this read, so
    /// the caller holds its own destination and copies the handle's bytes
    /// into it after flushing, the same way `RemoteTransport`'s callers
    /// consume a [`crate::transport::RequestHandle`].
    pub async fn get_deferred(&self, full_name: &str) -> Result<ReadHandle, EngineError> {
        self.get_handle(full_name, ReadMode::Deferred).await
    }

    async fn get_handle(&self, full_name: &str, mode: ReadMode) -> Result<ReadHandle, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        let (merged, owner) = self.resolve(full_name)?;
        owner.get(&merged.inner_name, mode).await
    }

    pub fn shape(&self, full_name: &str) -> Result<Option<Vec<u64>>, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.shape(&merged.inner_name))
    }

    pub fn min_max(&self, full_name: &str) -> Result<Option<MinMax>, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.min_max(&merged.inner_name))
    }

    pub fn blocks_info(&self, full_name: &str, step: u64) -> Result<Vec<BlockInfo>, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.blocks_info(&merged.inner_name, step))
    }

    pub fn all_steps_blocks_info(
        &self,
        full_name: &str,
    ) -> Result<std::collections::BTreeMap<u64, Vec<BlockInfo>>, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.all_steps_blocks_info(&merged.inner_name))
    }

    pub fn all_relative_steps_blocks_info(&self, full_name: &str) -> Result<Vec<Vec<BlockInfo>>, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.all_relative_steps_blocks_info(&merged.inner_name))
    }

    pub fn expr_str(&self, full_name: &str) -> Result<String, EngineError> {
        let (merged, owner) = self.resolve(full_name)?;
        Ok(owner.expr_str(&merged.inner_name))
    }

    /// Closes every sub-engine in reverse open order and marks the engine
    /// unusable (§4.8, §3 ownership). The first close error is returned;
    /// the rest are logged so one failing sub-engine does not prevent the
    /// others from being closed.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        for owned in self.engines.iter().rev() {
            if let Err(e) = owned.engine.close().await {
                error!(dataset = %owned.dataset_name, error = %e, "close failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BlobFile, Dataset, Host, Key};
    use crate::keyservice::StaticKeyService;
    use crate::process_group::LocalProcessGroup;
    use crate::subengine::{ElementType, MemorySubEngine};

    fn catalog_with_one_local_dataset() -> (CatalogData, Dataset) {
        let dataset = Dataset {
            uuid: "uuid-local".into(),
            name: "sim.bp".into(),
            host_idx: 0,
            dir_idx: 0,
            key_idx: None,
            files: vec![],
        };
        let mut datasets = std::collections::BTreeMap::new();
        datasets.insert(0, dataset.clone());
        let catalog = CatalogData {
            version: None,
            hosts: vec![Host {
                shortname: "cluster1".into(),
                fqdn: "cluster1.example.org".into(),
                dir_indices: vec![0],
            }],
            keys: vec![],
            directories: vec!["/data".into()],
            datasets,
        };
        (catalog, dataset)
    }

    #[test]
    fn begin_step_ends_at_two() {
        // Driven without an async runtime since FederatedEngine::begin_step
        // itself is synchronous; only `open` needs one.
        let mut engine = FederatedEngine {
            catalog: CatalogData::default(),
            engines: vec![],
            namespace: NamespaceMerger::new(),
            skipped: vec![],
            current_step: 0,
            closed: false,
        };
        assert_eq!(engine.begin_step(std::time::Duration::from_secs(1)), StepStatus::Ok);
        assert_eq!(
            engine.begin_step(std::time::Duration::from_secs(1)),
            StepStatus::EndOfStream
        );
        assert_eq!(
            engine.begin_step(std::time::Duration::from_secs(1)),
            StepStatus::EndOfStream
        );
    }

    #[tokio::test]
    async fn get_after_close_fails() {
        let mut engine = FederatedEngine {
            catalog: CatalogData::default(),
            engines: vec![],
            namespace: NamespaceMerger::new(),
            skipped: vec![],
            current_step: 0,
            closed: false,
        };
        engine.close().await.unwrap();
        let mut dest = vec![0u8; 4];
        let err = engine.get("x/y", &mut dest).await.unwrap_err();
        assert!(matches!(err, EngineError::Closed));
    }

    #[tokio::test]
    async fn get_on_unknown_merged_name_fails() {
        let engine = FederatedEngine {
            catalog: CatalogData::default(),
            engines: vec![],
            namespace: NamespaceMerger::new(),
            skipped: vec![],
            current_step: 0,
            closed: false,
        };
        let mut dest = vec![0u8; 4];
        let err = engine.get("missing/name", &mut dest).await.unwrap_err();
        assert!(matches!(err, EngineError::NameNotFound(_)));
    }

    #[tokio::test]
    async fn denied_key_skips_dataset_without_failing_open() {
        let dataset = Dataset {
            uuid: "uuid-locked".into(),
            name: "secret.bp".into(),
            host_idx: 0,
            dir_idx: 0,
            key_idx: Some(0),
            files: vec![BlobFile {
                dataset_uuid: "uuid-locked".into(),
                name: "meta".into(),
                compressed: false,
                length_original: 0,
                length_compressed: 0,
                ctime: 0,
            }],
        };
        let mut datasets = std::collections::BTreeMap::new();
        datasets.insert(0, dataset);
        let catalog = CatalogData {
            version: None,
            hosts: vec![Host {
                shortname: "cluster1".into(),
                fqdn: "cluster1.example.org".into(),
                dir_indices: vec![0],
            }],
            keys: vec![Key {
                id: "k1".into(),
                key_material: None,
            }],
            directories: vec!["/data".into()],
            datasets,
        };

        let tmp = tempfile::NamedTempFile::new().unwrap();
        crate::catalog::CatalogStore::write_for_test(tmp.path(), &catalog);

        let key_service = StaticKeyService::new().deny("k1");
        let opener = StaticSubEngineOpener::new();
        let pg = LocalProcessGroup;
        let mut options = Options::default();
        options.hostname = Some("cluster1".into());

        let engine = FederatedEngine::open(tmp.path(), &options, &key_service, &opener, &pg)
            .await
            .unwrap();
        assert_eq!(engine.skipped_datasets().len(), 1);
        assert_eq!(engine.skipped_datasets()[0].0, "secret.bp");
    }

    #[tokio::test]
    async fn inline_key_material_is_used_without_fetching() {
        // The key service below knows nothing about "k1" and would return
        // `Unavailable` if asked, so this dataset only opens successfully if
        // `resolve_key` used the catalog's own key material instead of
        // calling `fetch_key`.
        let dataset = Dataset {
            uuid: "uuid-inline-key".into(),
            name: "sim.bp".into(),
            host_idx: 0,
            dir_idx: 0,
            key_idx: Some(0),
            files: vec![],
        };
        let mut datasets = std::collections::BTreeMap::new();
        datasets.insert(0, dataset.clone());
        let catalog = CatalogData {
            version: None,
            hosts: vec![Host {
                shortname: "cluster1".into(),
                fqdn: "cluster1.example.org".into(),
                dir_indices: vec![0],
            }],
            keys: vec![Key {
                id: "k1".into(),
                key_material: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            }],
            directories: vec!["/data".into()],
            datasets,
        };

        let tmp = tempfile::NamedTempFile::new().unwrap();
        crate::catalog::CatalogStore::write_for_test(tmp.path(), &catalog);

        let mem = Arc::new(MemorySubEngine::new()) as Arc<dyn SubEngine>;
        let opener = StaticSubEngineOpener::new().with(dataset.uuid.clone(), mem);
        let key_service = StaticKeyService::new();
        let pg = LocalProcessGroup;
        let mut options = Options::default();
        options.hostname = Some("cluster1".into());

        let engine = FederatedEngine::open(tmp.path(), &options, &key_service, &opener, &pg)
            .await
            .unwrap();
        assert!(engine.skipped_datasets().is_empty());
    }

    #[tokio::test]
    async fn local_import_exposes_merged_names() {
        let (catalog, dataset) = catalog_with_one_local_dataset();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        crate::catalog::CatalogStore::write_for_test(tmp.path(), &catalog);

        let mem = Arc::new(
            MemorySubEngine::new().with_variable(
                VariableInfo {
                    name: "temperature".into(),
                    element_type: ElementType::F64,
                    shape: vec![1],
                },
                8u64.to_le_bytes().to_vec(),
            ),
        ) as Arc<dyn SubEngine>;
        let opener = StaticSubEngineOpener::new().with(dataset.uuid.clone(), mem);
        let key_service = StaticKeyService::new();
        let pg = LocalProcessGroup;
        let mut options = Options::default();
        options.hostname = Some("cluster1".into());

        let engine = FederatedEngine::open(tmp.path(), &options, &key_service, &opener, &pg)
            .await
            .unwrap();
        assert!(engine.skipped_datasets().is_empty());
        assert!(engine.variable_names().any(|n| n == "sim.bp/temperature"));
    }

    #[tokio::test]
    async fn deferred_get_is_filled_after_perform_gets() {
        let (catalog, dataset) = catalog_with_one_local_dataset();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        crate::catalog::CatalogStore::write_for_test(tmp.path(), &catalog);

        let mem = Arc::new(
            MemorySubEngine::new().with_variable(
                VariableInfo {
                    name: "temperature".into(),
                    element_type: ElementType::F64,
                    shape: vec![1],
                },
                8u64.to_le_bytes().to_vec(),
            ),
        ) as Arc<dyn SubEngine>;
        let opener = StaticSubEngineOpener::new().with(dataset.uuid.clone(), mem);
        let key_service = StaticKeyService::new();
        let pg = LocalProcessGroup;
        let mut options = Options::default();
        options.hostname = Some("cluster1".into());

        let engine = FederatedEngine::open(tmp.path(), &options, &key_service, &opener, &pg)
            .await
            .unwrap();

        let handle = engine.get_deferred("sim.bp/temperature").await.unwrap();
        engine.perform_gets().await.unwrap();
        let bytes = handle.wait().await.unwrap();
        let mut dest = vec![0u8; 8];
        dest.copy_from_slice(&bytes);
        assert_eq!(dest, 8u64.to_le_bytes().to_vec());
    }
}
