//! In-process [`ObjectStore`] for tests and dry runs
//!
//! Beyond plain storage it can imitate the awkward parts of a real bucket:
//! listings that keep showing deleted keys for a while ([`InMemoryObjectStore::with_listing_lag`]),
//! injected transient failures, and slow downloads.

use super::{ListPage, ObjectStore, ObjectSummary};
use async_trait::async_trait;
use ccw_common::{PipelineError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    /// Deleted keys that listings still report, with their old size
    ghosts: BTreeMap<String, u64>,
    listing_lag: bool,
    download_delay: Option<Duration>,
    failing_keys: HashMap<String, u32>,
    failing_listings: u32,
    gets: HashMap<String, u32>,
    downloads: HashMap<String, u32>,
}

impl State {
    fn take_failure(&mut self, key: &str, operation: &str) -> Result<()> {
        match self.failing_keys.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(PipelineError::TransientStore(format!(
                    "injected failure during {} of {}",
                    operation, key
                )))
            },
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deleted keys keep showing up in listings until [`settle`](Self::settle) is called
    pub fn with_listing_lag(self) -> Self {
        self.state().listing_lag = true;
        self
    }

    pub fn with_download_delay(self, delay: Duration) -> Self {
        self.state().download_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        let key = key.into();
        let mut state = self.state();
        state.ghosts.remove(&key);
        state.objects.insert(key, data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Let listings catch up with deletes
    pub fn settle(&self) {
        self.state().ghosts.clear();
    }

    /// Fail the next `times` get/download/copy/delete calls touching `key`
    pub fn fail_next(&self, key: impl Into<String>, times: u32) {
        self.state().failing_keys.insert(key.into(), times);
    }

    pub fn fail_next_listings(&self, times: u32) {
        self.state().failing_listings = times;
    }

    /// Successful and failed `get` calls for `key`
    pub fn get_count(&self, key: &str) -> u32 {
        self.state().gets.get(key).copied().unwrap_or(0)
    }

    pub fn download_count(&self, key: &str) -> u32 {
        self.state().downloads.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_page(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<String>,
    ) -> Result<ListPage> {
        let mut state = self.state();
        if state.failing_listings > 0 {
            state.failing_listings -= 1;
            return Err(PipelineError::TransientStore(format!(
                "injected failure listing {}",
                prefix
            )));
        }

        let mut listed: BTreeMap<&str, u64> = state
            .objects
            .iter()
            .map(|(k, v)| (k.as_str(), v.len() as u64))
            .collect();
        listed.extend(state.ghosts.iter().map(|(k, size)| (k.as_str(), *size)));

        let page_size = max_keys.max(1) as usize;
        let mut matching = listed
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| continuation_token.as_deref().is_none_or(|token| *k > token));

        let objects: Vec<ObjectSummary> = matching
            .by_ref()
            .take(page_size)
            .map(|(key, size)| ObjectSummary {
                key: key.to_string(),
                size,
                last_modified: Some(Utc::now()),
            })
            .collect();

        let next_continuation_token = match matching.next() {
            Some(_) => objects.last().map(|o| o.key.clone()),
            None => None,
        };

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        *state.gets.entry(key.to_string()).or_default() += 1;
        state.take_failure(key, "get")?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(key.to_string()))
    }

    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let delay = self.state().download_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = {
            let mut state = self.state();
            *state.downloads.entry(key.to_string()).or_default() += 1;
            state.take_failure(key, "download")?;
            state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(key.to_string()))?
        };

        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(source_key, "copy")?;
        let data = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(source_key.to_string()))?;
        state.ghosts.remove(dest_key);
        state.objects.insert(dest_key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(key, "delete")?;
        if let Some(data) = state.objects.remove(key) {
            if state.listing_lag {
                state.ghosts.insert(key.to_string(), data.len() as u64);
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.state().objects.contains_key(key))
    }
}
