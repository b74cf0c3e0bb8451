//! Per-dataset dispatch decision plus the typed configuration surface of §6.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::cache::CacheLayout;
use crate::catalog::{CatalogData, Dataset};
use crate::error::EngineError;

/// `protocol∈{local, s3, direct}` (§6). `Local` only ever arises implicitly
/// (the dataset's owning host equals the caller's); it is listed here so a
/// `[hostoptions]` block can still name it explicitly without being
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Local,
    S3,
    Direct,
}

impl Protocol {
    fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.to_ascii_lowercase().as_str() {
            "local" => Ok(Protocol::Local),
            "s3" => Ok(Protocol::S3),
            "direct" => Ok(Protocol::Direct),
            other => Err(EngineError::InvalidConfig(format!(
                "unrecognized protocol {other:?}, expected local|s3|direct"
            ))),
        }
    }
}

/// Per-host configuration block (§6 "Per-host options").
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub protocol: Protocol,
    pub endpoint: Option<String>,
    pub aws_profile: Option<String>,
    pub is_aws_ec2: bool,
    pub recheck_metadata: bool,
    pub verbose: u8,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Direct,
            endpoint: None,
            aws_profile: None,
            is_aws_ec2: false,
            recheck_metadata: false,
            verbose: 0,
        }
    }
}

/// The recognized top-level configuration keys of §6, already parsed and
/// validated, analogous to the teacher's `ClientConfig`.
#[derive(Debug, Clone)]
pub struct Options {
    pub verbose: u8,
    pub hostname: Option<String>,
    pub campaignstorepath: Option<String>,
    pub cachepath: PathBuf,
    pub hostoptions: HashMap<String, HostOptions>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: 0,
            hostname: None,
            campaignstorepath: None,
            cachepath: PathBuf::from("."),
            hostoptions: HashMap::new(),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.verbose > 5 {
            return Err(EngineError::InvalidConfig(format!(
                "verbose must be in [0, 5], got {}",
                self.verbose
            )));
        }
        for (host, opts) in &self.hostoptions {
            if opts.verbose > 5 {
                return Err(EngineError::InvalidConfig(format!(
                    "verbose for host {host} must be in [0, 5], got {}",
                    opts.verbose
                )));
            }
        }
        Ok(())
    }

    /// Parses a `protocol` string into `Protocol`, surfacing the same
    /// `InvalidConfig` error a malformed `[hostoptions]` entry would.
    pub fn parse_protocol(raw: &str) -> Result<Protocol, EngineError> {
        Protocol::parse(raw)
    }
}

/// The outcome of `SubEngineFactory::resolve` (§4.6): what the caller must
/// do to bring this dataset's sub-engine up. Carrying out a `Dispatch` (key
/// fetch, blob extraction, sub-engine construction) is `FederatedEngine`'s
/// job, not the factory's -- the factory only decides.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Local { path: PathBuf },
    S3 { endpoint: String, cache_dir: PathBuf },
    Remote { cache_dir: PathBuf, remote_host: String, remote_path: String },
}

/// Decides, for one dataset, whether to open it locally, via an
/// object-storage transport, or via a generic remote transport (§4.6).
pub struct SubEngineFactory {
    cache: CacheLayout,
}

impl SubEngineFactory {
    pub fn new(options: &Options) -> Self {
        Self {
            cache: CacheLayout::new(options.cachepath.clone()),
        }
    }

    pub fn cache_layout(&self) -> &CacheLayout {
        &self.cache
    }

    pub fn resolve(
        &self,
        dataset: &Dataset,
        catalog: &CatalogData,
        local_host: &str,
        campaign_name: &str,
        options: &Options,
    ) -> Result<Dispatch, EngineError> {
        let host = catalog.host(dataset.host_idx);
        let directory = catalog.directory(dataset.dir_idx);

        if host.shortname == local_host || host.fqdn == local_host {
            debug!(dataset = %dataset.name, "dispatching local open");
            return Ok(Dispatch::Local {
                path: PathBuf::from(directory).join(&dataset.name),
            });
        }

        let host_opts = options.hostoptions.get(&host.shortname);
        match host_opts.map(|o| o.protocol) {
            Some(Protocol::S3) => {
                let opts = host_opts.unwrap();
                let endpoint = opts.endpoint.clone().ok_or_else(|| {
                    EngineError::InvalidConfig(format!(
                        "host {} configured for s3 but has no endpoint",
                        host.shortname
                    ))
                })?;

                // Process-global environment, last writer wins (§6). The AWS
                // SDK only recognizes the case-insensitive string "true" for
                // this variable; anything else, including "1", is treated as
                // unset.
                std::env::set_var(
                    "AWS_EC2_METADATA_DISABLED",
                    if opts.is_aws_ec2 { "false" } else { "true" },
                );
                if let Some(profile) = &opts.aws_profile {
                    std::env::set_var("AWS_PROFILE", profile);
                }

                debug!(dataset = %dataset.name, endpoint = %endpoint, "dispatching s3 open");
                Ok(Dispatch::S3 {
                    endpoint,
                    cache_dir: self.cache.s3_cache_dir(&host.shortname, campaign_name),
                })
            }
            _ => {
                debug!(dataset = %dataset.name, host = %host.shortname, "dispatching generic remote open");
                Ok(Dispatch::Remote {
                    cache_dir: self.cache.dataset_dir(&dataset.uuid),
                    remote_host: host.shortname.clone(),
                    remote_path: format!("{directory}/{}", dataset.name),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Host;

    fn dataset(host_idx: usize, dir_idx: usize) -> Dataset {
        Dataset {
            uuid: "uuid-1".into(),
            name: "sim.bp".into(),
            host_idx,
            dir_idx,
            key_idx: None,
            files: vec![],
        }
    }

    fn catalog_with_hosts(names: &[&str]) -> CatalogData {
        CatalogData {
            version: None,
            hosts: names
                .iter()
                .map(|n| Host {
                    shortname: n.to_string(),
                    fqdn: format!("{n}.example.org"),
                    dir_indices: vec![0],
                })
                .collect(),
            keys: vec![],
            directories: vec!["/data".into()],
            datasets: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn validate_rejects_out_of_range_verbose() {
        let mut options = Options::default();
        options.verbose = 6;
        assert!(options.validate().is_err());
    }

    #[test]
    fn local_host_dispatches_local() {
        let catalog = catalog_with_hosts(&["cluster1"]);
        let ds = dataset(0, 0);
        let factory = SubEngineFactory::new(&Options::default());
        let dispatch = factory
            .resolve(&ds, &catalog, "cluster1", "camp", &Options::default())
            .unwrap();
        assert!(matches!(dispatch, Dispatch::Local { path } if path == PathBuf::from("/data/sim.bp")));
    }

    #[test]
    fn remote_host_without_hostoptions_dispatches_generic_remote() {
        let catalog = catalog_with_hosts(&["cluster2"]);
        let ds = dataset(0, 0);
        let factory = SubEngineFactory::new(&Options::default());
        let dispatch = factory
            .resolve(&ds, &catalog, "cluster1", "camp", &Options::default())
            .unwrap();
        assert!(matches!(dispatch, Dispatch::Remote { remote_host, .. } if remote_host == "cluster2"));
    }

    #[test]
    fn remote_host_with_s3_hostoptions_dispatches_s3() {
        let catalog = catalog_with_hosts(&["cluster2"]);
        let ds = dataset(0, 0);
        let mut options = Options::default();
        options.hostoptions.insert(
            "cluster2".into(),
            HostOptions {
                protocol: Protocol::S3,
                endpoint: Some("https://s3.example.org".into()),
                aws_profile: Some("profile1".into()),
                is_aws_ec2: false,
                recheck_metadata: false,
                verbose: 0,
            },
        );
        let factory = SubEngineFactory::new(&options);
        let dispatch = factory
            .resolve(&ds, &catalog, "cluster1", "camp", &options)
            .unwrap();
        assert!(matches!(dispatch, Dispatch::S3 { endpoint, .. } if endpoint == "https://s3.example.org"));
    }

    #[test]
    fn s3_without_endpoint_is_invalid_config() {
        let catalog = catalog_with_hosts(&["cluster2"]);
        let ds = dataset(0, 0);
        let mut options = Options::default();
        options.hostoptions.insert(
            "cluster2".into(),
            HostOptions {
                protocol: Protocol::S3,
                endpoint: None,
                ..HostOptions::default()
            },
        );
        let factory = SubEngineFactory::new(&options);
        let err = factory
            .resolve(&ds, &catalog, "cluster1", "camp", &options)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
