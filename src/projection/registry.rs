//! Basis registry: reuse vs. refit decisions.
//!
//! Maps a [`BasisId`] to its fitted [`PcaBasis`]. Each id owns a slot with its
//! own lock, so concurrent resolvers of one id fit at most once (the first
//! caller fits, the rest wait and reuse) while different ids never block each
//! other. Ad-hoc bases live in an LRU; the `"default"` basis is pinned.
//! Evicted bases come back from the optional durable [`BasisStore`] before any
//! refit is considered.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::basis::{PcaBasis, COMPONENTS};
use super::error::{ProjectionError, Result};
use crate::embedding::Embedding;

/// Reserved id of the basis fit on the default corpus.
pub const DEFAULT_BASIS_ID: &str = "default";

/// Prefix of ids derived from a fit word set.
const DERIVED_PREFIX: &str = "fit-";

/// Identifier of a fitted basis, handed to clients so later requests can
/// reuse the same projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisId(String);

impl BasisId {
    /// Derive the id for a fit word set. Case, duplicates and order do not
    /// matter: words are lowercased, deduplicated, sorted, joined with `\n`
    /// and hashed.
    pub fn derive<S: AsRef<str>>(words: &[S]) -> Self {
        let mut normalized: Vec<String> = words.iter().map(|w| w.as_ref().to_lowercase()).collect();
        normalized.sort();
        normalized.dedup();

        let mut hasher = Sha256::new();
        for word in &normalized {
            hasher.update(word.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        Self(format!("{DERIVED_PREFIX}{}", hex::encode(&digest[..8])))
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_BASIS_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BasisId {
    fn default() -> Self {
        Self(DEFAULT_BASIS_ID.to_string())
    }
}

impl From<String> for BasisId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for BasisId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for BasisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted basis and the digest of the word set it was fit on, if known.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBasis {
    pub basis: PcaBasis,
    pub source: Option<String>,
}

/// Durable id → basis storage, used to survive eviction and restarts.
pub trait BasisStore: Send + Sync {
    fn load(&self, id: &BasisId) -> anyhow::Result<Option<StoredBasis>>;

    fn save(&self, id: &BasisId, basis: &PcaBasis, source: Option<&str>) -> anyhow::Result<()>;

    fn remove(&self, id: &BasisId) -> anyhow::Result<()>;
}

/// Counters reported by [`BasisRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Bases fit from embeddings.
    pub fits: u64,
    /// Lookups answered by an already-registered basis.
    pub reuses: u64,
    /// Bases loaded back from the durable store.
    pub restores: u64,
    /// Ad-hoc bases dropped from memory by the LRU.
    pub evictions: u64,
    /// Bases currently held in memory, default included.
    pub resident: usize,
}

#[derive(Default)]
struct Counters {
    fits: AtomicU64,
    reuses: AtomicU64,
    restores: AtomicU64,
    evictions: AtomicU64,
}

type Slot = Arc<Mutex<Option<Arc<PcaBasis>>>>;

pub struct BasisRegistry {
    default: Slot,
    slots: Mutex<LruCache<BasisId, Slot>>,
    store: Option<Arc<dyn BasisStore>>,
    default_source: Option<String>,
    counters: Counters,
}

impl BasisRegistry {
    /// In-memory registry holding up to `max_bases` ad-hoc bases.
    pub fn new(max_bases: usize) -> Self {
        let capacity = NonZeroUsize::new(max_bases).unwrap_or(NonZeroUsize::MIN);
        Self {
            default: Slot::default(),
            slots: Mutex::new(LruCache::new(capacity)),
            store: None,
            default_source: None,
            counters: Counters::default(),
        }
    }

    /// Persist fitted bases to `store` and restore from it on a miss.
    pub fn with_store(mut self, store: Arc<dyn BasisStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Tie the default basis to a digest of the corpus it is fit on. A stored
    /// default basis with a different digest is ignored and refit.
    pub fn with_default_source(mut self, digest: impl Into<String>) -> Self {
        self.default_source = Some(digest.into());
        self
    }

    /// Return the basis registered under `id`, fitting it if allowed.
    ///
    /// - registered: returned as is, even when `fit_source` is given;
    /// - persisted in the durable store: restored, no refit;
    /// - `"default"` or `allow_fit`: fit from `fit_source`, then registered;
    /// - otherwise: [`ProjectionError::UnknownBasis`].
    ///
    /// `fit_source` runs at most once and only when a fit actually happens.
    pub fn resolve<F>(&self, id: &BasisId, fit_source: Option<F>, allow_fit: bool) -> Result<Arc<PcaBasis>>
    where
        F: FnOnce() -> Result<Vec<Embedding>>,
    {
        let slot = self.slot(id)?;
        let mut guard = lock_slot(&slot)?;

        if let Some(basis) = guard.as_ref() {
            self.counters.reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(basis));
        }

        match self.fill(id, &mut guard, fit_source, allow_fit) {
            Ok(basis) => Ok(basis),
            Err(e) => {
                self.discard_if_unshared(id, &slot)?;
                Err(e)
            }
        }
    }

    /// Whether `id` currently has a basis in memory. Does not touch recency.
    pub fn contains(&self, id: &BasisId) -> bool {
        let slot = if id.is_default() {
            Some(Arc::clone(&self.default))
        } else {
            self.slots
                .lock()
                .ok()
                .and_then(|slots| slots.peek(id).cloned())
        };
        slot.and_then(|s| s.lock().ok().map(|g| g.is_some()))
            .unwrap_or(false)
    }

    /// Drop an ad-hoc basis from memory. The durable copy, if any, stays and
    /// will be restored on the next lookup. Returns whether it was resident.
    pub fn evict(&self, id: &BasisId) -> Result<bool> {
        if id.is_default() {
            return Ok(lock_slot(&self.default)?.take().is_some());
        }
        Ok(self.lock_slots()?.pop(id).is_some())
    }

    /// Forget the default basis in memory and in the durable store so the
    /// next default lookup refits it.
    pub fn reset_default(&self) -> Result<()> {
        let mut guard = lock_slot(&self.default)?;
        *guard = None;
        if let Some(store) = &self.store {
            store
                .remove(&BasisId::default())
                .map_err(|e| ProjectionError::Storage(format!("{e:#}")))?;
        }
        tracing::info!("default basis reset");
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let default_resident = lock_slot(&self.default).map(|g| g.is_some()).unwrap_or(false);
        let ad_hoc = self.slots.lock().map(|s| s.len()).unwrap_or(0);
        RegistryStats {
            fits: self.counters.fits.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            restores: self.counters.restores.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            resident: ad_hoc + usize::from(default_resident),
        }
    }

    /// Get or create the slot for `id`, marking it most recently used.
    fn slot(&self, id: &BasisId) -> Result<Slot> {
        if id.is_default() {
            return Ok(Arc::clone(&self.default));
        }

        let mut slots = self.lock_slots()?;
        if let Some(slot) = slots.get(id) {
            return Ok(Arc::clone(slot));
        }

        let slot = Slot::default();
        if slots.len() == slots.cap().get() {
            // A slot held by a caller may still be fitting; evict the least
            // recently used idle one. If every slot is busy, the LRU goes
            // anyway and its id may be fit a second time.
            let victim = slots
                .iter()
                .rev()
                .find(|(_, s)| Arc::strong_count(s) == 1)
                .map(|(k, _)| k.clone());
            let evicted = match victim {
                Some(victim) => slots.pop_entry(&victim),
                None => slots.pop_lru(),
            };
            if let Some((evicted, _)) = evicted {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(basis = %evicted, "evicted basis from memory");
            }
        }
        slots.put(id.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    /// Restore or fit the basis for an empty slot. Caller holds the slot lock.
    fn fill<F>(
        &self,
        id: &BasisId,
        guard: &mut MutexGuard<'_, Option<Arc<PcaBasis>>>,
        fit_source: Option<F>,
        allow_fit: bool,
    ) -> Result<Arc<PcaBasis>>
    where
        F: FnOnce() -> Result<Vec<Embedding>>,
    {
        if let Some(store) = &self.store {
            let restored = store
                .load(id)
                .map_err(|e| ProjectionError::Storage(format!("{e:#}")))?;
            match restored {
                Some(stored) if self.is_current(id, &stored) => {
                    self.counters.restores.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(basis = %id, "restored basis from store");
                    let basis = Arc::new(stored.basis);
                    **guard = Some(Arc::clone(&basis));
                    return Ok(basis);
                }
                Some(_) => {
                    tracing::info!(basis = %id, "default corpus changed since the stored basis was fit");
                }
                None => {}
            }
        }

        if !(id.is_default() || allow_fit) {
            return Err(ProjectionError::UnknownBasis(id.to_string()));
        }
        let source = match fit_source {
            Some(source) => source,
            None if id.is_default() => {
                return Err(ProjectionError::InsufficientData {
                    required: COMPONENTS,
                    got: 0,
                })
            }
            None => return Err(ProjectionError::UnknownBasis(id.to_string())),
        };

        let embeddings = source()?;
        let basis = Arc::new(PcaBasis::fit(&embeddings)?);
        self.counters.fits.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            basis = %id,
            rows = basis.fitted_on(),
            dim = basis.dimensions(),
            "fitted new basis"
        );

        if let Some(store) = &self.store {
            // The fitted basis is still served if it cannot be persisted.
            let source = self.default_source.as_deref().filter(|_| id.is_default());
            if let Err(e) = store.save(id, &basis, source) {
                tracing::warn!(basis = %id, error = %e, "failed to persist basis");
            }
        }

        **guard = Some(Arc::clone(&basis));
        Ok(basis)
    }

    /// A stored default basis is only current when it was fit on the
    /// configured corpus. Ad-hoc ids already name their word set.
    fn is_current(&self, id: &BasisId, stored: &StoredBasis) -> bool {
        match (&self.default_source, id.is_default()) {
            (Some(expected), true) => stored.source.as_deref() == Some(expected.as_str()),
            _ => true,
        }
    }

    /// Remove a still-empty ad-hoc slot after a failed resolve, unless another
    /// caller already holds it (and may fill it).
    fn discard_if_unshared(&self, id: &BasisId, slot: &Slot) -> Result<()> {
        if id.is_default() {
            return Ok(());
        }
        let mut slots = self.lock_slots()?;
        let ours = slots.peek(id).is_some_and(|s| Arc::ptr_eq(s, slot));
        // One reference in the map, one held by this caller.
        if ours && Arc::strong_count(slot) == 2 {
            slots.pop(id);
        }
        Ok(())
    }

    fn lock_slots(&self) -> Result<MutexGuard<'_, LruCache<BasisId, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| ProjectionError::Storage(format!("registry lock poisoned: {e}")))
    }
}

fn lock_slot(slot: &Slot) -> Result<MutexGuard<'_, Option<Arc<PcaBasis>>>> {
    slot.lock()
        .map_err(|e| ProjectionError::Storage(format!("basis lock poisoned: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn set_a() -> Vec<Embedding> {
        vec![
            vec![1.0, 0.0, 0.0, 0.5],
            vec![0.0, 2.0, 0.0, 0.1],
            vec![0.0, 0.0, 3.0, 0.2],
            vec![1.0, 1.0, 1.0, 0.0],
        ]
    }

    fn set_b() -> Vec<Embedding> {
        vec![
            vec![9.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 7.0, 4.0],
            vec![5.0, 5.0, 0.0, 0.0],
            vec![0.0, 3.0, 0.0, 8.0],
        ]
    }

    fn ok_source(set: Vec<Embedding>) -> Option<impl FnOnce() -> Result<Vec<Embedding>>> {
        Some(move || Ok(set))
    }

    fn no_source() -> Option<fn() -> Result<Vec<Embedding>>> {
        None
    }

    #[test]
    fn registered_basis_wins_over_new_fit_source() {
        let registry = BasisRegistry::new(8);
        let id = BasisId::derive(&["cat", "dog"]);

        let first = registry.resolve(&id, ok_source(set_a()), true).unwrap();
        let second = registry.resolve(&id, ok_source(set_b()), true).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.stats().fits, 1);
        assert_eq!(registry.stats().reuses, 1);
    }

    #[test]
    fn fit_source_is_not_called_on_reuse() {
        let registry = BasisRegistry::new(8);
        let id = BasisId::from("custom");
        registry.resolve(&id, ok_source(set_a()), true).unwrap();

        let called = AtomicUsize::new(0);
        registry
            .resolve(
                &id,
                Some(|| {
                    called.fetch_add(1, Ordering::SeqCst);
                    Ok(set_b())
                }),
                true,
            )
            .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_id_without_fit_permission_fails() {
        let registry = BasisRegistry::new(8);
        let err = registry
            .resolve(&BasisId::from("fit-0123"), ok_source(set_a()), false)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::UnknownBasis(id) if id == "fit-0123"));
        // Failed lookups do not occupy the LRU.
        assert_eq!(registry.stats().resident, 0);
    }

    #[test]
    fn default_fits_even_without_allow_fit() {
        let registry = BasisRegistry::new(8);
        let basis = registry
            .resolve(&BasisId::default(), ok_source(set_a()), false)
            .unwrap();
        assert_eq!(basis.fitted_on(), 4);
        assert!(registry.contains(&BasisId::default()));
    }

    #[test]
    fn default_without_source_is_insufficient_data() {
        let registry = BasisRegistry::new(8);
        let err = registry
            .resolve(&BasisId::default(), no_source(), true)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InsufficientData { .. }));
    }

    #[test]
    fn failed_fit_leaves_id_unregistered() {
        let registry = BasisRegistry::new(8);
        let id = BasisId::from("tiny");
        let err = registry
            .resolve(&id, ok_source(vec![vec![1.0, 2.0, 3.0]]), true)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InsufficientData { got: 1, .. }));
        assert!(!registry.contains(&id));

        // A later valid fit succeeds.
        registry.resolve(&id, ok_source(set_a()), true).unwrap();
        assert!(registry.contains(&id));
    }

    #[test]
    fn default_is_pinned_across_lru_pressure() {
        let registry = BasisRegistry::new(2);
        let default = registry
            .resolve(&BasisId::default(), ok_source(set_a()), true)
            .unwrap();
        for name in ["one", "two", "three"] {
            registry
                .resolve(&BasisId::from(name), ok_source(set_b()), true)
                .unwrap();
        }

        assert!(!registry.contains(&BasisId::from("one")));
        assert!(registry.contains(&BasisId::from("three")));
        let again = registry
            .resolve(&BasisId::default(), no_source(), false)
            .unwrap();
        assert!(Arc::ptr_eq(&default, &again));
        assert_eq!(registry.stats().evictions, 1);
    }

    #[test]
    fn reset_default_forces_refit() {
        let registry = BasisRegistry::new(4);
        registry
            .resolve(&BasisId::default(), ok_source(set_a()), true)
            .unwrap();
        registry.reset_default().unwrap();
        assert!(!registry.contains(&BasisId::default()));
        registry
            .resolve(&BasisId::default(), ok_source(set_b()), true)
            .unwrap();
        assert_eq!(registry.stats().fits, 2);
    }

    #[test]
    fn concurrent_resolvers_fit_once() {
        let registry = Arc::new(BasisRegistry::new(8));
        let fits = Arc::new(AtomicUsize::new(0));
        let id = BasisId::derive(&["fish", "bird", "tree"]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let fits = Arc::clone(&fits);
                let id = id.clone();
                std::thread::spawn(move || {
                    registry
                        .resolve(
                            &id,
                            Some(|| {
                                fits.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(std::time::Duration::from_millis(20));
                                Ok(set_a())
                            }),
                            true,
                        )
                        .unwrap()
                })
            })
            .collect();

        let bases: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(fits.load(Ordering::SeqCst), 1);
        assert!(bases.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[derive(Default)]
    struct MapStore {
        rows: Mutex<std::collections::HashMap<BasisId, StoredBasis>>,
    }

    impl BasisStore for MapStore {
        fn load(&self, id: &BasisId) -> anyhow::Result<Option<StoredBasis>> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        fn save(&self, id: &BasisId, basis: &PcaBasis, source: Option<&str>) -> anyhow::Result<()> {
            let stored = StoredBasis {
                basis: basis.clone(),
                source: source.map(str::to_string),
            };
            self.rows.lock().unwrap().insert(id.clone(), stored);
            Ok(())
        }

        fn remove(&self, id: &BasisId) -> anyhow::Result<()> {
            self.rows.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[test]
    fn stored_default_from_another_corpus_is_refit() {
        let store = Arc::new(MapStore::default());
        let old = BasisRegistry::new(4)
            .with_store(store.clone())
            .with_default_source("corpus-v1");
        old.resolve(&BasisId::default(), ok_source(set_a()), true).unwrap();

        let same = BasisRegistry::new(4)
            .with_store(store.clone())
            .with_default_source("corpus-v1");
        same.resolve(&BasisId::default(), no_source(), true).unwrap();
        assert_eq!(same.stats().restores, 1);
        assert_eq!(same.stats().fits, 0);

        let grown = BasisRegistry::new(4)
            .with_store(store.clone())
            .with_default_source("corpus-v2");
        let basis = grown
            .resolve(&BasisId::default(), ok_source(set_b()), true)
            .unwrap();
        assert_eq!(grown.stats().restores, 0);
        assert_eq!(grown.stats().fits, 1);
        assert_eq!(basis.fitted_on(), set_b().len());

        let stored = store.load(&BasisId::default()).unwrap().unwrap();
        assert_eq!(stored.source.as_deref(), Some("corpus-v2"));
    }

    #[test]
    fn ad_hoc_bases_are_saved_without_source() {
        let store = Arc::new(MapStore::default());
        let registry = BasisRegistry::new(4)
            .with_store(store.clone())
            .with_default_source("corpus-v1");
        let id = BasisId::derive(&["cat", "dog"]);
        registry.resolve(&id, ok_source(set_a()), true).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().source, None);
    }

    #[test]
    fn slot_being_fit_is_not_evicted() {
        use std::sync::mpsc;

        let registry = BasisRegistry::new(2);
        let busy = BasisId::from("busy");
        let idle = BasisId::from("idle");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        std::thread::scope(|scope| {
            let fitting = scope.spawn(|| {
                registry.resolve(
                    &busy,
                    Some(move || {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(set_a())
                    }),
                    true,
                )
            });
            entered_rx.recv().unwrap();

            // "busy" is least recently used but mid-fit; "idle" goes instead.
            registry.resolve(&idle, ok_source(set_b()), true).unwrap();
            registry
                .resolve(&BasisId::from("third"), ok_source(set_b()), true)
                .unwrap();

            release_tx.send(()).unwrap();
            fitting.join().unwrap().unwrap();
        });

        assert!(registry.contains(&busy));
        assert!(!registry.contains(&idle));
        registry.resolve(&busy, no_source(), false).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.fits, 3);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn derived_id_ignores_order_case_and_duplicates() {
        let a = BasisId::derive(&["cat", "dog"]);
        let b = BasisId::derive(&["dog", "cat"]);
        let c = BasisId::derive(&["Dog", "cat", "dog"]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(a.as_str().starts_with("fit-"));
        assert_eq!(a.as_str().len(), "fit-".len() + 16);
    }

    #[test]
    fn derived_id_is_delimited() {
        // Plain concatenation would make these collide ("abc").
        assert_ne!(BasisId::derive(&["ab", "c"]), BasisId::derive(&["a", "bc"]));
    }

    #[test]
    fn default_id_is_reserved_literal() {
        assert_eq!(BasisId::default().as_str(), "default");
        assert!(BasisId::from("default").is_default());
        assert!(!BasisId::derive(&["default"]).is_default());
    }
}
