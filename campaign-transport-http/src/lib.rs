//! Pooled HTTP `RemoteTransport` implementation (§4.4), analogous in shape
//! to the teacher crate's runtime-specific `Connection` implementation.

mod encode;
mod keyservice;
mod pool;

pub use keyservice::RemoteKeyService;
pub use pool::{global, HttpTransportPool};
