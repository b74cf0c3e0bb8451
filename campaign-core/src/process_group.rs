//! The MPI process-group seam (§5): out of scope as a feature (§1), but part
//! of `FederatedEngine::open`'s signature in the original, so it is modeled
//! here as a trait with a single-process default implementation.

use async_trait::async_trait;

use crate::error::EngineError;

/// Rank/size/broadcast primitives a federated engine needs from its process
/// group. Each process loads the catalog independently from the same file,
/// so no collective protocol is required beyond broadcasting the catalog
/// path/bytes when a caller wants every rank to agree on exactly which
/// catalog file was opened.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> u32;
    fn size(&self) -> u32;

    /// Distributes `path` (as chosen by rank 0) to every other rank.
    /// `LocalProcessGroup` simply returns its input unchanged.
    async fn broadcast_file(&self, path: &str) -> Result<String, EngineError>;
}

/// The single-process default: `rank() == 0`, `size() == 1`, broadcast is
/// the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessGroup;

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> u32 {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    async fn broadcast_file(&self, path: &str) -> Result<String, EngineError> {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_group_is_rank_zero_of_one() {
        let pg = LocalProcessGroup;
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.size(), 1);
        assert_eq!(pg.broadcast_file("/data/c.db").await.unwrap(), "/data/c.db");
    }
}
