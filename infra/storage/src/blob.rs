//! Ephemeral object URLs.
//!
//! A [`BlobRegistry`] maps minted `blob:lumen/<scope>/<id>` strings to in-memory payloads, the
//! way a browser maps blob URLs to blobs. Every backend owns a [`UrlCache`] on top of the shared
//! registry so that each `(namespace, id)` has at most one live handle, and every handle it minted
//! is revoked on overwrite, delete, clear, or drop.

use crate::error::StorageError;
use crate::metadata::Payload;
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Prefix shared by every URL minted by a [`BlobRegistry`].
pub const OBJECT_URL_PREFIX: &str = "blob:lumen/";

/// A handle to a payload held by a [`BlobRegistry`].
///
/// Cloning is cheap; clones compare equal and share the same allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(Arc<str>);

impl ObjectUrl {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether both handles come from the same mint (not merely equal strings).
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Process-wide table of live object URLs.
#[derive(Debug, Clone, Default)]
pub struct BlobRegistry {
    entries: Arc<RwLock<FxHashMap<Arc<str>, Arc<Payload>>>>,
}

impl BlobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new URL for `payload` under `scope` (usually the backend's wire name).
    pub fn create(&self, scope: &str, payload: Payload) -> ObjectUrl {
        let url: Arc<str> = format!("{OBJECT_URL_PREFIX}{scope}/{}", nanoid::nanoid!()).into();
        self.entries.write().insert(Arc::clone(&url), Arc::new(payload));
        trace!(url = %url, "Object URL minted");
        ObjectUrl(url)
    }

    /// Releases `url`. Returns `false` for foreign or already revoked URLs.
    pub fn revoke(&self, url: &str) -> bool {
        let removed = self.entries.write().remove(url).is_some();
        if removed {
            trace!(url, "Object URL revoked");
        }
        removed
    }

    /// Dereferences a live URL.
    #[must_use]
    pub fn fetch(&self, url: &str) -> Option<Arc<Payload>> {
        self.entries.read().get(url).cloned()
    }

    #[must_use]
    pub fn is_live(&self, url: &str) -> bool {
        self.entries.read().contains_key(url)
    }

    /// Number of URLs currently alive, for leak diagnostics.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_object_url(url: &str) -> bool {
        url.starts_with(OBJECT_URL_PREFIX)
    }
}

/// Logical partitions a backend mints URLs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Namespace {
    Files,
    Thumbnails,
}

/// Per-backend cache guaranteeing at most one live URL per `(namespace, id)`.
#[derive(Debug)]
pub(crate) struct UrlCache {
    registry: BlobRegistry,
    scope: &'static str,
    slots: Mutex<Slots>,
}

type Key = (Namespace, String);

#[derive(Debug, Default)]
struct Slots {
    urls: FxHashMap<Key, ObjectUrl>,
    /// Epoch of the latest invalidation of each key since the last `clear`.
    invalidated: FxHashMap<Key, u64>,
    cleared: u64,
    epoch: u64,
}

impl Slots {
    fn invalidate(&mut self, key: &Key) -> Option<ObjectUrl> {
        self.epoch += 1;
        self.invalidated.insert(key.clone(), self.epoch);
        self.urls.remove(key)
    }

    fn is_current(&self, key: &Key, ticket: Ticket) -> bool {
        self.invalidated.get(key).copied().unwrap_or(0).max(self.cleared) <= ticket.0
    }
}

/// Cache epoch observed before loading a payload. See [`UrlCache::get_or_mint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket(u64);

impl UrlCache {
    pub(crate) fn new(registry: BlobRegistry, scope: &'static str) -> Self {
        Self { registry, scope, slots: Mutex::new(Slots::default()) }
    }

    pub(crate) fn get(&self, ns: Namespace, id: &str) -> Option<ObjectUrl> {
        self.slots.lock().urls.get(&(ns, id.to_owned())).cloned()
    }

    /// Take before loading the payload handed to [`Self::get_or_mint`].
    pub(crate) fn ticket(&self) -> Ticket {
        Ticket(self.slots.lock().epoch)
    }

    /// Returns the cached URL, or mints one for `payload` if none exists yet.
    ///
    /// Returns `None` without minting when `(ns, id)` was evicted, replaced or cleared after
    /// `ticket` was taken: `payload` may predate a write and must be loaded again.
    pub(crate) fn get_or_mint(
        &self,
        ns: Namespace,
        id: &str,
        ticket: Ticket,
        payload: Payload,
    ) -> Option<ObjectUrl> {
        let key = (ns, id.to_owned());
        let mut slots = self.slots.lock();
        if let Some(url) = slots.urls.get(&key) {
            return Some(url.clone());
        }
        if !slots.is_current(&key, ticket) {
            return None;
        }
        let url = self.registry.create(self.scope, payload);
        slots.urls.insert(key, url.clone());
        Some(url)
    }

    /// Serves the cached URL for `(ns, id)` or mints one from `load`, reloading whenever a write
    /// lands between the load and the mint.
    pub(crate) async fn resolve<F, Fut>(
        &self,
        ns: Namespace,
        id: &str,
        load: F,
    ) -> Result<Option<ObjectUrl>, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Payload>, StorageError>>,
    {
        loop {
            if let Some(url) = self.get(ns, id) {
                return Ok(Some(url));
            }
            let ticket = self.ticket();
            let Some(payload) = load().await? else {
                return Ok(None);
            };
            if let Some(url) = self.get_or_mint(ns, id, ticket, payload) {
                return Ok(Some(url));
            }
            trace!(id, "Payload changed while loading, reloading");
        }
    }

    /// Mints a fresh URL for `payload`, revoking whatever was cached before.
    pub(crate) fn replace(&self, ns: Namespace, id: &str, payload: Payload) -> ObjectUrl {
        let url = self.registry.create(self.scope, payload);
        let key = (ns, id.to_owned());
        let previous = {
            let mut slots = self.slots.lock();
            let previous = slots.invalidate(&key);
            slots.urls.insert(key, url.clone());
            previous
        };
        if let Some(previous) = previous {
            self.registry.revoke(previous.as_str());
        }
        url
    }

    /// Drops and revokes the cached URL for `(ns, id)`, if any.
    pub(crate) fn evict(&self, ns: Namespace, id: &str) {
        let previous = self.slots.lock().invalidate(&(ns, id.to_owned()));
        if let Some(previous) = previous {
            self.registry.revoke(previous.as_str());
        }
    }

    /// Revokes `url` and forgets any cache entry pointing at it.
    pub(crate) fn purge_handle(&self, url: &str) {
        if !BlobRegistry::is_object_url(url) {
            return;
        }
        {
            let mut slots = self.slots.lock();
            let stale: Vec<Key> = slots
                .urls
                .iter()
                .filter(|(_, cached)| cached.as_str() == url)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                slots.invalidate(key);
            }
        }
        self.registry.revoke(url);
    }

    /// Revokes every URL this cache minted.
    pub(crate) fn clear(&self) {
        let drained: Vec<ObjectUrl> = {
            let mut slots = self.slots.lock();
            slots.epoch += 1;
            slots.cleared = slots.epoch;
            slots.invalidated.clear();
            slots.urls.drain().map(|(_, url)| url).collect()
        };
        for url in &drained {
            self.registry.revoke(url.as_str());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().urls.len()
    }
}

impl Drop for UrlCache {
    fn drop(&mut self) {
        for (_, url) in self.slots.get_mut().urls.drain() {
            self.registry.revoke(url.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn cache() -> (BlobRegistry, UrlCache) {
        let registry = BlobRegistry::new();
        let cache = UrlCache::new(registry.clone(), "memory");
        (registry, cache)
    }

    fn mint(cache: &UrlCache, ns: Namespace, id: &str, byte: u8) -> ObjectUrl {
        cache.get_or_mint(ns, id, cache.ticket(), Payload::new(vec![byte])).unwrap()
    }

    #[test]
    fn minted_urls_resolve_until_revoked() {
        let registry = BlobRegistry::new();
        let url = registry.create("opfs", Payload::typed(b"abc".to_vec(), "text/plain"));

        assert!(url.as_str().starts_with("blob:lumen/opfs/"));
        assert!(BlobRegistry::is_object_url(url.as_str()));
        assert_eq!(registry.fetch(url.as_str()).map(|p| p.bytes.clone()), Some(b"abc".to_vec()));

        assert!(registry.revoke(url.as_str()));
        assert!(!registry.revoke(url.as_str()), "second revoke is a no-op");
        assert!(registry.fetch(url.as_str()).is_none());
    }

    #[test]
    fn get_or_mint_reuses_existing_handle() {
        let (registry, cache) = cache();
        let first = mint(&cache, Namespace::Files, "a", 1);
        let second = mint(&cache, Namespace::Files, "a", 2);

        assert!(ObjectUrl::ptr_eq(&first, &second));
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.fetch(first.as_str()).map(|p| p.bytes.clone()), Some(vec![1]));
    }

    #[test]
    fn namespaces_are_independent() {
        let (registry, cache) = cache();
        let file = mint(&cache, Namespace::Files, "a", 1);
        let thumb = mint(&cache, Namespace::Thumbnails, "a", 2);

        assert_ne!(file, thumb);
        cache.evict(Namespace::Files, "a");
        assert!(!registry.is_live(file.as_str()));
        assert!(registry.is_live(thumb.as_str()));
    }

    #[test]
    fn replace_revokes_previous_handle() {
        let (registry, cache) = cache();
        let old = cache.replace(Namespace::Thumbnails, "a", Payload::new(vec![1]));
        let new = cache.replace(Namespace::Thumbnails, "a", Payload::new(vec![2]));

        assert!(!registry.is_live(old.as_str()));
        assert!(registry.is_live(new.as_str()));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn purge_handle_forgets_entry() {
        let (registry, cache) = cache();
        let url = mint(&cache, Namespace::Files, "a", 1);

        cache.purge_handle(url.as_str());
        cache.purge_handle("https://example.com/not-ours.png");
        assert!(!registry.is_live(url.as_str()));
        assert!(cache.get(Namespace::Files, "a").is_none());
    }

    #[test]
    fn clear_and_drop_release_everything() {
        let (registry, cache) = cache();
        mint(&cache, Namespace::Files, "a", 1);
        mint(&cache, Namespace::Files, "b", 2);
        cache.clear();
        assert_eq!(registry.live_count(), 0);
        assert_eq!(cache.len(), 0);

        mint(&cache, Namespace::Files, "c", 3);
        drop(cache);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn loads_overtaken_by_a_write_are_not_minted() {
        let (registry, cache) = cache();
        let ticket = cache.ticket();
        cache.evict(Namespace::Files, "a");

        assert!(cache.get_or_mint(Namespace::Files, "a", ticket, Payload::new(vec![1])).is_none());
        assert_eq!(registry.live_count(), 0);

        let other = cache.get_or_mint(Namespace::Files, "b", ticket, Payload::new(vec![2]));
        assert!(other.is_some(), "other ids are unaffected");

        cache.clear();
        assert!(cache.get_or_mint(Namespace::Files, "b", ticket, Payload::new(vec![3])).is_none());
        let fresh = cache.ticket();
        assert!(cache.get_or_mint(Namespace::Files, "b", fresh, Payload::new(vec![4])).is_some());
    }

    #[tokio::test]
    async fn resolve_reloads_when_a_write_lands_mid_load() {
        let (registry, cache) = cache();
        let loads = AtomicU8::new(0);

        let url = cache
            .resolve(Namespace::Files, "a", || {
                let load = loads.fetch_add(1, Ordering::SeqCst);
                if load == 0 {
                    cache.evict(Namespace::Files, "a");
                }
                async move { Ok(Some(Payload::new(vec![load]))) }
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(registry.fetch(url.as_str()).map(|p| p.bytes.clone()), Some(vec![1]));
        assert_eq!(registry.live_count(), 1);
        let cached = cache.get(Namespace::Files, "a").unwrap();
        assert!(ObjectUrl::ptr_eq(&cached, &url));
    }
}
