use std::collections::HashSet;
use std::sync::Arc;

use cip_core::FoundItem;
use cip_storage::{CanonicalStore, ImportQueue, StoreError};
use tracing::debug;

/// Drops found items that are already published or already queued under any status.
#[derive(Clone)]
pub struct DeduplicationGate {
    canonical: Arc<dyn CanonicalStore>,
    queue: Arc<dyn ImportQueue>,
}

impl DeduplicationGate {
    pub fn new(canonical: Arc<dyn CanonicalStore>, queue: Arc<dyn ImportQueue>) -> Self {
        Self { canonical, queue }
    }

    pub async fn filter_new(&self, items: Vec<FoundItem>) -> Result<Vec<FoundItem>, StoreError> {
        if items.is_empty() {
            return Ok(items);
        }

        let ids = items
            .iter()
            .map(|item| item.external_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let published = self.canonical.existing_external_ids(&ids).await?;
        let queued = self.queue.known_external_ids(&ids).await?;

        let offered = items.len();
        let mut seen = HashSet::new();
        let fresh = items
            .into_iter()
            .filter(|item| {
                !published.contains(&item.external_id)
                    && !queued.contains(&item.external_id)
                    && seen.insert(item.external_id.clone())
            })
            .collect::<Vec<_>>();

        debug!(
            offered,
            published = published.len(),
            queued = queued.len(),
            fresh = fresh.len(),
            "deduplication gate applied"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use cip_core::{QueueStatus, TerminalStatus};
    use cip_storage::MemoryStore;

    use super::*;

    fn found(external_id: &str) -> FoundItem {
        FoundItem {
            external_id: external_id.to_string(),
            aggregate_id: None,
            candidate_id: None,
            title: "Untitled".into(),
            artist: None,
            year: None,
            formats: Vec::new(),
        }
    }

    fn gate(store: &Arc<MemoryStore>) -> DeduplicationGate {
        DeduplicationGate::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn published_items_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.publish("100");

        let fresh = gate(&store)
            .filter_new(vec![found("100"), found("101")])
            .await
            .unwrap();
        let ids = fresh.iter().map(|i| i.external_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["101"]);
    }

    #[tokio::test]
    async fn queued_items_are_dropped_even_when_terminal() {
        let store = Arc::new(MemoryStore::new());
        store.enqueue(&[found("200"), found("201")]).await.unwrap();
        let claimed = store.claim_batch(1).await.unwrap().remove(0);
        store
            .mark_terminal(claimed.id, TerminalStatus::Failed, Some("boom"), &[])
            .await
            .unwrap();
        assert_eq!(store.item(claimed.id).unwrap().status, QueueStatus::Failed);

        let fresh = gate(&store)
            .filter_new(vec![found("200"), found("201"), found("202")])
            .await
            .unwrap();
        let ids = fresh.iter().map(|i| i.external_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["202"]);
    }

    #[tokio::test]
    async fn repeated_ids_keep_the_first_occurrence() {
        let store = Arc::new(MemoryStore::new());
        let mut second = found("300");
        second.title = "Second".into();

        let fresh = gate(&store)
            .filter_new(vec![found("300"), second, found("301")])
            .await
            .unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].title, "Untitled");
    }
}
