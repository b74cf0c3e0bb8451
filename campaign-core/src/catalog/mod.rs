//! The campaign catalog: its in-memory data model ([`model`]) and the
//! loader/extractor that builds it from a SQLite database ([`store`]).

mod model;
mod store;

pub use model::{BlobFile, CatalogData, CatalogVersion, Dataset, Host, Key};
pub use store::CatalogStore;
