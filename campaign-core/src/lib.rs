//! Data model, catalog loader, key-service client, cache layout, and
//! federated-read engine for the campaign reader (§1).
//!
//! This crate depends only on the [`subengine::SubEngine`] and
//! [`transport::RemoteTransport`] seam traits, never on a concrete
//! container-format or wire-protocol crate -- `campaign-transport-http` and
//! `campaign-transport-rpc` provide the two shipped `RemoteTransport`
//! implementations, and a real storage-engine crate would provide
//! `SubEngine`.

pub mod cache;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod factory;
pub mod keyservice;
pub mod namespace;
pub mod process_group;
pub mod subengine;
pub mod transport;

pub use cache::CacheLayout;
pub use catalog::{CatalogData, CatalogStore};
pub use engine::{FederatedEngine, StaticSubEngineOpener, SubEngineOpener};
pub use error::{CacheError, CatalogError, EngineError, KeyServiceError, TransportError};
pub use factory::{Dispatch, HostOptions, Options, Protocol, SubEngineFactory};
pub use keyservice::{KeyFetchResult, KeyService, StaticKeyService, KEY_DENIED_SENTINEL};
pub use namespace::{MergedVariable, NamespaceMerger};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use subengine::{ElementType, MemorySubEngine, ReadHandle, ReadMode, StepStatus, SubEngine};
pub use transport::{
    AccuracyRequirement, FileHandle, GetRequest, OpenMode, RemoteTransport, RequestHandle,
    TransportParams,
};
