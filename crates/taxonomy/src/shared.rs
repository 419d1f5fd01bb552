use crate::error::Result;
use crate::tree::TaxonomyTree;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Single-writer handle to a taxonomy shared across tasks.
///
/// Readers work on snapshots; each `mutate` call runs against a scratch copy
/// and is published only if it succeeds, so a failed edit is never half-applied.
#[derive(Debug, Clone)]
pub struct SharedTaxonomy {
    inner: Arc<RwLock<TaxonomyTree>>,
}

impl SharedTaxonomy {
    #[must_use]
    pub fn new(tree: TaxonomyTree) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    pub async fn snapshot(&self) -> TaxonomyTree {
        self.inner.read().await.clone()
    }

    /// Runs a read-only query under the shared lock.
    pub async fn read<R>(&self, f: impl FnOnce(&TaxonomyTree) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    pub async fn mutate<R>(&self, f: impl FnOnce(&mut TaxonomyTree) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.write().await;
        let mut scratch = guard.clone();
        let out = f(&mut scratch)?;
        *guard = scratch;
        Ok(out)
    }

    /// Swaps in a whole new tree, e.g. after rebuilding from clusters.
    pub async fn replace(&self, tree: TaxonomyTree) -> TaxonomyTree {
        let mut guard = self.inner.write().await;
        std::mem::replace(&mut *guard, tree)
    }
}
