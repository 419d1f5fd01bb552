use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// A sample waiting to be blended into a category prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeUpdate {
    pub category_path: String,
    pub embedding: Vec<f32>,
}

impl PrototypeUpdate {
    pub fn new(category_path: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            category_path: category_path.into(),
            embedding,
        }
    }
}

/// FIFO of prototype updates produced by concurrent readers.
///
/// Classification never writes the prototype store directly; it pushes here
/// and the engine drains the queue under the store's write lock.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: Mutex<VecDeque<PrototypeUpdate>>,
}

impl UpdateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, update: PrototypeUpdate) {
        self.pending.lock().await.push_back(update);
    }

    pub async fn extend(&self, updates: impl IntoIterator<Item = PrototypeUpdate>) {
        self.pending.lock().await.extend(updates);
    }

    /// Takes everything queued so far, oldest first.
    pub async fn drain(&self) -> Vec<PrototypeUpdate> {
        self.pending.lock().await.drain(..).collect()
    }

    /// Drops queued updates for `category_path` and everything below it.
    pub async fn discard_category(&self, category_path: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|u| {
            !(u.category_path == category_path
                || u
                    .category_path
                    .strip_prefix(category_path)
                    .is_some_and(|rest| rest.starts_with('/')))
        });
        before - pending.len()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_pushes_all_arrive() {
        let queue = Arc::new(UpdateQueue::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let queue = queue.clone();
            tasks.spawn(async move {
                queue
                    .push(PrototypeUpdate::new(format!("C{}", i % 4), vec![1.0]))
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(queue.len().await, 16);
        assert_eq!(queue.drain().await.len(), 16);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn discard_category_keeps_siblings() {
        let queue = UpdateQueue::new();
        queue
            .extend([
                PrototypeUpdate::new("Work", vec![1.0]),
                PrototypeUpdate::new("Work/Reports", vec![1.0]),
                PrototypeUpdate::new("Workshop", vec![1.0]),
            ])
            .await;
        assert_eq!(queue.discard_category("Work").await, 2);
        let left: Vec<String> = queue
            .drain()
            .await
            .into_iter()
            .map(|u| u.category_path)
            .collect();
        assert_eq!(left, vec!["Workshop".to_string()]);
    }
}
