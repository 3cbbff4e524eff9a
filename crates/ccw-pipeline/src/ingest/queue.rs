//! Pending and completed data sets, as seen in the bucket's listings

use super::config::ExtractionOptions;
use super::manifest::{DataSetManifest, DataSetManifestId, ManifestKeyMatcher, ManifestLocation};
use super::transfer::TransferManager;
use ccw_common::{PipelineError, Result};
use futures::TryStreamExt;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many handed-off data sets are remembered
pub const RECENTLY_PROCESSED_CAPACITY: usize = 100;

/// Bounded set of identities, oldest evicted first
#[derive(Debug)]
struct RecentlyProcessed {
    order: VecDeque<DataSetManifestId>,
    members: HashSet<DataSetManifestId>,
    capacity: usize,
}

impl RecentlyProcessed {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: DataSetManifestId) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &DataSetManifestId) -> bool {
        self.members.contains(id)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Ordered view of the data sets waiting in the bucket.
///
/// Only the job touches the queue, so it needs no locking.
pub struct DataSetQueue {
    transfer: Arc<TransferManager>,
    options: ExtractionOptions,
    matcher: ManifestKeyMatcher,
    pending: BTreeMap<DataSetManifestId, DataSetManifest>,
    recently_processed: RecentlyProcessed,
    completed_count: Option<usize>,
}

impl DataSetQueue {
    pub fn new(transfer: Arc<TransferManager>, options: ExtractionOptions) -> Result<Self> {
        Ok(Self {
            transfer,
            options,
            matcher: ManifestKeyMatcher::new()?,
            pending: BTreeMap::new(),
            recently_processed: RecentlyProcessed::new(RECENTLY_PROCESSED_CAPACITY),
            completed_count: None,
        })
    }

    /// Re-list both incoming prefixes and merge what is found into the pending set
    pub async fn update_pending_data_sets(&mut self) -> Result<()> {
        let mut listed = HashSet::new();

        for location in ManifestLocation::incoming_prefixes() {
            let prefix = format!("{}/", location.prefix());
            let mut objects = self.transfer.list_objects(&prefix, self.options.list_max_keys);

            while let Some(object) = objects.try_next().await? {
                let Some(key) = self.matcher.parse_incoming(&object.key)? else {
                    continue;
                };
                if self.recently_processed.contains(&key.id) {
                    debug!(manifest = %key.id, "Skipping data set that was already processed");
                    continue;
                }
                listed.insert(key.id);
                if self.pending.contains_key(&key.id) {
                    continue;
                }

                let body = match self.transfer.get_object(&object.key).await {
                    Ok(body) => body,
                    Err(e) if e.is_not_found() => {
                        // Listed but already moved away
                        debug!(key = %object.key, "Manifest vanished before it could be read");
                        listed.remove(&key.id);
                        continue;
                    },
                    Err(e) => return Err(e),
                };
                let manifest = DataSetManifest::parse(&key, &object.key, &body)?;

                if let Some(allowed) = self.options.allowed_rif_type {
                    if !manifest.contains_only(allowed) {
                        info!(
                            manifest = %manifest.id(),
                            allowed = %allowed,
                            "Skipping data set with other RIF file types"
                        );
                        listed.remove(&key.id);
                        continue;
                    }
                }

                debug!(manifest = %manifest.id(), entries = manifest.entries().len(), "Found pending data set");
                self.pending.insert(key.id, manifest);
            }
        }

        self.pending.retain(|id, _| listed.contains(id));

        if self.completed_count.is_none() {
            if let Err(e) = self.refresh_completed_count().await {
                warn!(error = %e, "Could not count completed data sets");
            }
        }

        Ok(())
    }

    /// Count manifests under the Done prefixes
    pub async fn refresh_completed_count(&mut self) -> Result<usize> {
        let mut count = 0;
        for location in ManifestLocation::completed_prefixes() {
            let prefix = format!("{}/", location.prefix());
            count += self
                .transfer
                .list_objects(&prefix, self.options.list_max_keys)
                .try_filter(|object| futures::future::ready(self.matcher.is_completed(&object.key)))
                .try_fold(0usize, |n, _| futures::future::ready(Ok::<_, PipelineError>(n + 1)))
                .await?;
        }
        self.completed_count = Some(count);
        Ok(count)
    }

    /// The oldest pending data set
    pub fn next_data_set_to_process(&self) -> Option<DataSetManifest> {
        self.pending.values().next().cloned()
    }

    /// The data set after [`next_data_set_to_process`](Self::next_data_set_to_process)
    pub fn second_data_set_to_process(&self) -> Option<DataSetManifest> {
        self.pending.values().nth(1).cloned()
    }

    pub fn pending_manifests_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_manifest_ids(&self) -> Vec<DataSetManifestId> {
        self.pending.keys().copied().collect()
    }

    /// `None` until the completed listing has been counted once. May lag behind the bucket.
    pub fn completed_manifests_count(&self) -> Option<usize> {
        self.completed_count
    }

    pub fn is_pending(&self, id: &DataSetManifestId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn is_processed(&self, id: &DataSetManifestId) -> bool {
        self.recently_processed.contains(id)
    }

    pub fn recently_processed_count(&self) -> usize {
        self.recently_processed.len()
    }

    /// Must be called before the data set's relocation is submitted
    pub fn mark_processed(&mut self, manifest: &DataSetManifest) {
        let id = manifest.id();
        self.pending.remove(&id);
        self.recently_processed.insert(id);

        if matches!(
            manifest.target_location(),
            ManifestLocation::Done | ManifestLocation::DoneSynthetic
        ) {
            if let Some(count) = self.completed_count.as_mut() {
                *count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn id(minute: u32) -> DataSetManifestId {
        DataSetManifestId {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 18, 10, minute, 0).single().unwrap_or_default(),
            sequence_id: 0,
            synthetic: false,
        }
    }

    #[test]
    fn test_recently_processed_evicts_oldest() {
        let mut recent = RecentlyProcessed::new(2);
        recent.insert(id(1));
        recent.insert(id(2));
        recent.insert(id(2));
        assert_eq!(recent.len(), 2);

        recent.insert(id(3));
        assert!(!recent.contains(&id(1)));
        assert!(recent.contains(&id(2)));
        assert!(recent.contains(&id(3)));
    }
}
