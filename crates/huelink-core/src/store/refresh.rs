// ── Refresh application logic ──
//
// Pulls bridge snapshots into the ResourceStore. Unseen resources are
// created before existing ones are merged, so owners are cached by the
// time their buttons are classified. Any resource whose sequence moved
// while the request was in flight is left alone: its stream data is newer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::ResourceStore;
use crate::error::CoreError;
use crate::model::reference::Reference;
use crate::model::resource::Resource;
use crate::update::{Batch, Update};

const ALL_RESOURCES: &str = "/resource";

impl ResourceStore {
    /// Fetch every resource from the bridge and merge it into the cache.
    ///
    /// Returns the updates this refresh produced. Creations are not updates.
    pub async fn refresh(&self) -> Result<Vec<Arc<Update>>, CoreError> {
        let before: HashMap<String, u64> = self
            .all()
            .into_iter()
            .map(|r| (r.id().to_owned(), r.sequence()))
            .collect();

        let data = self.client.get_v2(ALL_RESOURCES).await?;
        let now = Utc::now();
        let batch = Batch::refresh();

        let mut known = Vec::with_capacity(before.len());
        let mut created = 0usize;
        for item in &data {
            let reference = match Reference::from_value(item) {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed resource in refresh");
                    continue;
                }
            };
            match before.get(&reference.rid) {
                Some(&sequence) => known.push((reference.rid, sequence, item)),
                None => {
                    let (resource, fresh) =
                        self.insert_or_merge(reference, item.clone(), &batch.expecting(0));
                    resource.mark_checked(now);
                    if fresh {
                        created += 1;
                    }
                }
            }
        }

        let mut updates = Vec::new();
        let mut skipped = 0usize;
        for (id, sequence, item) in known {
            let Some(resource) = self.get(&id) else {
                continue;
            };
            resource.mark_checked(now);
            if resource.sequence() != sequence {
                skipped += 1;
                continue;
            }
            if let Some(update) = self.apply(&resource, &batch.expecting(sequence), item) {
                updates.push(update);
            }
        }

        self.last_refresh.send_replace(Some(Utc::now()));
        tracing::info!(
            resources = self.len(),
            created,
            updated = updates.len(),
            skipped,
            "refresh complete"
        );
        Ok(updates)
    }

    /// Fetch one resource and merge the result.
    ///
    /// The merge is dropped if another update landed during the fetch.
    pub async fn refresh_resource(
        &self,
        resource: &Arc<Resource>,
    ) -> Result<Option<Arc<Update>>, CoreError> {
        let sequence = resource.sequence();
        let data = self.client.get_v2(&resource.endpoint()).await?;
        resource.mark_checked(Utc::now());

        let Some(item) = data.first() else {
            tracing::debug!(id = resource.id(), "fetch returned no data");
            return Ok(None);
        };
        Ok(self.apply(resource, &Batch::fetch().expecting(sequence), item))
    }

    /// Refresh each resource in `resources`, logging failures.
    pub async fn refresh_each(&self, resources: &[Arc<Resource>]) -> Vec<Arc<Update>> {
        let mut updates = Vec::new();
        for resource in resources {
            match self.refresh_resource(resource).await {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(e) => tracing::warn!(id = resource.id(), error = %e, "resource refresh failed"),
            }
        }
        updates
    }
}
