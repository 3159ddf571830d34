//! Profilestore storage engine
//!
//! The engine orchestrates all components:
//! - Write path: Key → Dictionary → plan → Tree chunks + Segment → Dimensions
//! - Read path: Key → Segment cover → Tree chunks → merge → Dictionary
//!
//! Everything lives in per-kind write-back caches over one SQLite store.
//! Each object has its own lock, so requests for different series never
//! contend; a background task keeps the resident size under budget.

use crate::index::{dimension_id, intersect, Dimension, LabelCatalog};
use crate::storage::cache::{Cache, Evict};
use crate::storage::codec::Kind;
use crate::storage::dict::Dictionary;
use crate::storage::error::{check_deadline, StorageError, StorageResult};
use crate::storage::key::Key;
use crate::storage::kv::KvStore;
use crate::storage::segment::{Resolution, Segment};
use crate::storage::tree::{ChunkTree, Tree};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// Resident size above which the background cycle evicts
    pub cache_max_bytes: usize,
    /// Period of the background eviction / write-back cycle
    pub eviction_interval: Duration,
    /// Chunk durations per level
    pub resolution: Resolution,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("profilestore_data"),
            cache_max_bytes: 256 * 1024 * 1024, // 256MB
            eviction_interval: Duration::from_millis(5000),
            resolution: Resolution::default(),
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> StorageResult<()> {
        if self.eviction_interval.is_zero() {
            return Err(StorageError::Config(
                "eviction interval must be positive".to_string(),
            ));
        }
        self.resolution.validate()
    }
}

impl From<&crate::config::StorageConfig> for StorageConfig {
    fn from(file: &crate::config::StorageConfig) -> Self {
        Self {
            data_dir: file.data_dir.clone(),
            cache_max_bytes: file.cache_max_bytes,
            eviction_interval: Duration::from_millis(file.eviction_interval_ms),
            resolution: Resolution {
                base_secs: file.base_resolution_secs,
                multiplier: file.resolution_multiplier,
                levels: file.max_levels,
            },
        }
    }
}

/// A profile to ingest
#[derive(Debug, Clone)]
pub struct PutInput {
    pub key: Key,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tree: Tree,
    pub spy_name: String,
    pub sample_rate: u32,
    pub deadline: Option<Instant>,
}

impl PutInput {
    pub fn new(key: Key, start: DateTime<Utc>, end: DateTime<Utc>, tree: Tree) -> Self {
        Self {
            key,
            start,
            end,
            tree,
            spy_name: String::new(),
            sample_rate: 0,
            deadline: None,
        }
    }

    /// Builder method: profiler name and sampling rate
    pub fn metadata(mut self, spy_name: impl Into<String>, sample_rate: u32) -> Self {
        self.spy_name = spy_name.into();
        self.sample_rate = sample_rate;
        self
    }

    /// Builder method: give up if not committed by `deadline`
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A query for one series over a window
#[derive(Debug, Clone)]
pub struct GetInput {
    pub key: Key,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

impl GetInput {
    pub fn new(key: Key, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            key,
            start,
            end,
            deadline: None,
        }
    }

    /// Builder method: give up if not answered by `deadline`
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Merged profile for a window
#[derive(Debug, Clone, Default)]
pub struct GetOutput {
    pub tree: Tree,
    pub spy_name: String,
    pub sample_rate: u32,
    /// Part of the requested window actually backed by data
    pub covered: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl GetOutput {
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// The main profilestore storage engine
pub struct Storage {
    /// Configuration
    config: StorageConfig,
    /// Shared persistent store
    kv: Arc<KvStore>,
    dimensions: Cache<Dimension>,
    segments: Cache<Segment>,
    dictionaries: Cache<Dictionary>,
    trees: Cache<ChunkTree>,
    /// Resident label → values view
    catalog: LabelCatalog,
    /// False once closed; requests hold a read guard for their duration
    open: RwLock<bool>,
}

impl Storage {
    /// Open (or create) a store under `config.data_dir`
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;

        let kv = Arc::new(KvStore::open(&config.data_dir)?);

        let catalog = LabelCatalog::new();
        let mut skipped = 0usize;
        kv.scan_prefix(Kind::Dimension.prefix().as_bytes(), |key, _| {
            let id = std::str::from_utf8(&key[Kind::Dimension.prefix().len()..]).ok();
            if id.and_then(|id| catalog.insert_id(id)).is_none() {
                skipped += 1;
            }
            true
        })?;
        if skipped > 0 {
            tracing::warn!("Skipped {} malformed dimension keys", skipped);
        }

        tracing::info!(
            data_dir = %config.data_dir.display(),
            labels = catalog.pair_count(),
            "Opened storage"
        );

        Ok(Self {
            dimensions: Cache::new(Arc::clone(&kv)),
            segments: Cache::new(Arc::clone(&kv)),
            dictionaries: Cache::new(Arc::clone(&kv)),
            trees: Cache::new(Arc::clone(&kv)),
            kv,
            catalog,
            config,
            open: RwLock::new(true),
        })
    }

    /// Ingest a profile
    ///
    /// The tree is interned through the series dictionary and merged into
    /// its chunks under the segment lock, so readers see either all of it
    /// or none of it. The series only becomes visible through its labels
    /// once that commit succeeded.
    pub fn put(&self, input: PutInput) -> StorageResult<()> {
        let open = self.open.read();
        if !*open {
            return Err(StorageError::Closed);
        }

        let (start, end) = whole_seconds(input.start, input.end)?;
        let series = input.key.normalized();

        let dict = self.dictionaries.get_or_create(&series, Dictionary::new)?;
        let mut ids = ChunkTree::new();
        dict.update_if(|d| {
            let before = d.len();
            ids = d.intern_tree(&input.tree);
            d.len() > before
        });

        let existing = self.segments.get(&series)?;
        let resolution = match &existing {
            Some(segment) => segment.read(|s| *s.resolution()),
            None => self.config.resolution,
        };
        let placements = resolution.plan(start, end, &ids, input.deadline)?;

        check_deadline(input.deadline)?;

        let segment = match existing {
            Some(segment) => segment,
            None => self
                .segments
                .get_or_create(&series, || Segment::new(resolution))?,
        };
        segment.try_update(|seg| {
            // Resolve every chunk before touching any, so a failed load
            // leaves nothing half-merged
            let chunks = placements
                .iter()
                .map(|p| {
                    self.trees
                        .get_or_create(&p.chunk.tree_id(&series), ChunkTree::new)
                })
                .collect::<StorageResult<Vec<_>>>()?;

            for (placement, chunk) in placements.iter().zip(&chunks) {
                chunk.update(|t| t.merge(&placement.tree));
                seg.record(placement);
            }
            seg.set_metadata(&input.spy_name, input.sample_rate);
            Ok(())
        })?;

        for (label, value) in input.key.labels() {
            let dim = self
                .dimensions
                .get_or_create(&dimension_id(label, value), Dimension::new)?;
            dim.update_if(|d| d.insert(&series));
            self.catalog.insert(label, value);
        }

        tracing::trace!(series = %series, chunks = placements.len(), "Put profile");
        Ok(())
    }

    /// Merge all stored samples of a series within `[start, end)`
    ///
    /// An unknown series yields an empty output, not an error.
    pub fn get(&self, input: GetInput) -> StorageResult<GetOutput> {
        let open = self.open.read();
        if !*open {
            return Err(StorageError::Closed);
        }

        let (start, end) = whole_seconds(input.start, input.end)?;
        let series = input.key.normalized();

        let Some(segment) = self.segments.get(&series)? else {
            return Ok(GetOutput::default());
        };

        let (merged, spy_name, sample_rate, covered) = segment.read(|seg| {
            let chunks = seg.cover(start, end);
            let mut merged = ChunkTree::new();
            for chunk in &chunks {
                check_deadline(input.deadline)?;
                match self.trees.require(&chunk.tree_id(&series)) {
                    Ok(entry) => entry.read(|t| merged.merge(t)),
                    Err(StorageError::NotFound(what)) => tracing::warn!(
                        series = %series,
                        "Skipping chunk listed in segment: {}",
                        what
                    ),
                    Err(e) => return Err(e),
                }
            }

            let covered = match (chunks.first(), chunks.last()) {
                (Some(first), Some(last)) => Some((first.start.max(start), last.end.min(end))),
                _ => None,
            };
            Ok::<_, StorageError>((
                merged,
                seg.spy_name().to_string(),
                seg.sample_rate(),
                covered,
            ))
        })?;

        let tree = if merged.is_empty() {
            Tree::new()
        } else {
            match self.dictionaries.get(&series)? {
                Some(dict) => dict.read(|d| d.resolve_tree(&merged))?,
                None => Dictionary::new().resolve_tree(&merged)?,
            }
        };

        let covered = match covered {
            Some((from, until)) => Some((to_datetime(from)?, to_datetime(until)?)),
            None => None,
        };

        Ok(GetOutput {
            tree,
            spy_name,
            sample_rate,
            covered,
        })
    }

    /// Visit the known values of `label` in sorted order until `visit`
    /// returns false
    pub fn get_values<F>(&self, label: &str, visit: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.catalog.values(label, visit);
    }

    /// Every known label name, `__name__` included
    pub fn labels(&self) -> Vec<String> {
        self.catalog.labels()
    }

    /// Canonical keys of the series carrying every `(label, value)` pair
    pub fn series_matching(&self, matchers: &[(&str, &str)]) -> StorageResult<Vec<String>> {
        let mut dims = Vec::with_capacity(matchers.len());
        for (label, value) in matchers {
            match self.dimensions.get(&dimension_id(label, value))? {
                Some(entry) => dims.push(entry.read(Dimension::clone)),
                None => return Ok(Vec::new()),
            }
        }
        Ok(intersect(&dims))
    }

    /// Storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            dimensions: self.dimensions.len(),
            segments: self.segments.len(),
            dictionaries: self.dictionaries.len(),
            trees: self.trees.len(),
            resident_bytes: self.resident_bytes(),
        }
    }

    fn cache(&self, kind: Kind) -> &dyn Evict {
        match kind {
            Kind::Dimension => &self.dimensions,
            Kind::Segment => &self.segments,
            Kind::Dictionary => &self.dictionaries,
            Kind::Tree => &self.trees,
        }
    }

    fn resident_bytes(&self) -> usize {
        Kind::all()
            .iter()
            .map(|&kind| self.cache(kind).resident_bytes())
            .sum()
    }

    /// Write every dirty object back to the store
    ///
    /// Kinds are written in [`Kind::write_order`], so a persisted object
    /// never references one that is not. A failing kind stops the pass:
    /// it and every later kind stay dirty for the next attempt.
    pub fn flush(&self) -> StorageResult<usize> {
        let mut written = 0;
        for &kind in Kind::write_order() {
            match self.cache(kind).flush() {
                Ok(n) => written += n,
                Err(e) => {
                    tracing::warn!("Failed to flush {} cache: {}", kind, e);
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Drop least recently used objects while over the memory budget
    ///
    /// Everything dirty is written back first, in dependency order, so the
    /// shedding pass never persists a chunk ahead of its dictionary.
    /// Returns the bytes freed.
    pub fn evict(&self) -> StorageResult<usize> {
        let budget = self.config.cache_max_bytes;
        if self.resident_bytes() <= budget {
            return Ok(0);
        }
        self.flush()?;

        let mut resident = self.resident_bytes();
        let mut freed = 0;
        for &kind in Kind::all() {
            if resident <= budget {
                break;
            }
            let n = self.cache(kind).shed(resident - budget);
            resident = resident.saturating_sub(n);
            freed += n;
        }

        tracing::debug!(freed, resident, budget, "Eviction cycle");
        Ok(freed)
    }

    /// One background cycle: write back and evict while over budget, then
    /// write back whatever is still dirty
    pub fn run_cycle(&self) -> StorageResult<()> {
        self.evict()?;
        self.flush()?;
        Ok(())
    }

    /// Start background eviction task
    pub fn start_background_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(self);
        let period = storage.config.eviction_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if storage.is_closed() {
                    break;
                }

                let cycle = Arc::clone(&storage);
                match tokio::task::spawn_blocking(move || cycle.run_cycle()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Background eviction cycle failed: {}", e),
                    Err(e) => tracing::error!("Background eviction task panicked: {}", e),
                }
            }

            tracing::debug!("Background eviction stopped");
        })
    }

    /// Flush everything and refuse further requests
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn close(&self) -> StorageResult<()> {
        let mut open = self.open.write();
        if !*open {
            return Ok(());
        }
        *open = false;

        let written = self.flush()?;
        if let Err(e) = self.kv.checkpoint() {
            tracing::warn!("WAL checkpoint on close failed: {}", e);
        }

        tracing::info!(written, "Storage closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !*self.open.read()
    }

    /// Get data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close storage on drop: {}", e);
        }
    }
}

/// Unix seconds of `[start, end)`, with the end rounded up so a window
/// shorter than a second still holds its samples
fn whole_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> StorageResult<(i64, i64)> {
    if end <= start {
        return Err(StorageError::InvalidTimeRange);
    }
    let end_secs = end.timestamp() + i64::from(end.timestamp_subsec_nanos() > 0);
    Ok((start.timestamp(), end_secs))
}

fn to_datetime(secs: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(StorageError::InvalidTimeRange)
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub dimensions: usize,
    pub segments: usize,
    pub dictionaries: usize,
    pub trees: usize,
    pub resident_bytes: usize,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dimensions: {}, Segments: {}, Dictionaries: {}, Trees: {}, Resident: {:.2} MB",
            self.dimensions,
            self.segments,
            self.dictionaries,
            self.trees,
            self.resident_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn tree(stacks: &[(&str, u64)]) -> Tree {
        let mut t = Tree::new();
        for (stack, count) in stacks {
            t.insert_stack(stack, *count).unwrap();
        }
        t
    }

    fn create_test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        (storage, dir)
    }

    fn put(storage: &Storage, key: &str, from: i64, until: i64, t: &Tree) {
        let input = PutInput::new(Key::parse(key).unwrap(), ts(from), ts(until), t.clone());
        storage.put(input).unwrap();
    }

    fn get(storage: &Storage, key: &str, from: i64, until: i64) -> GetOutput {
        storage
            .get(GetInput::new(Key::parse(key).unwrap(), ts(from), ts(until)))
            .unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("a;b", 1), ("a;c", 2)]);

        put(&storage, "tree key1", 10, 19, &t);
        let out = get(&storage, "tree key1", 0, 30);

        assert_eq!(out.tree.to_string(), t.to_string());
        assert_eq!(out.covered, Some((ts(10), ts(20))));
    }

    #[test]
    fn test_results_independent_of_write_granularity() {
        let (a, _dir_a) = create_test_storage();
        let (b, _dir_b) = create_test_storage();
        let t = tree(&[("a;b", 1), ("a;c", 2)]);
        let mut doubled = t.clone();
        doubled.merge(&t);

        put(&a, "tree key1", 10, 19, &t);
        put(&a, "tree key1", 20, 29, &t);
        put(&b, "tree key1", 10, 29, &doubled);

        let out_a = get(&a, "tree key1", 0, 30);
        let out_b = get(&b, "tree key1", 0, 30);
        assert_eq!(out_a.tree.to_string(), out_b.tree.to_string());
        assert_eq!(out_a.tree.to_string(), doubled.to_string());
    }

    #[test]
    fn test_long_window_served_from_coarse_levels() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("main;work", 3)]);
        for start in (0..1000).step_by(10) {
            put(&storage, "app{}", start, start + 10, &t);
        }

        let out = get(&storage, "app{}", 0, 1000);
        assert_eq!(out.tree.total(), 300);
        let partial = get(&storage, "app{}", 100, 150);
        assert_eq!(partial.tree.total(), 15);
    }

    #[test]
    fn test_restart_durability() {
        let dir = tempdir().unwrap();
        let t = tree(&[("a;b", 1), ("a;c", 2)]);
        {
            let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
            let input = PutInput::new(Key::parse("tree key1").unwrap(), ts(10), ts(19), t.clone())
                .metadata("gospy", 100);
            storage.put(input).unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        let out = get(&storage, "tree key1", 0, 30);
        assert_eq!(out.tree.to_string(), t.to_string());
        assert_eq!(out.spy_name, "gospy");
        assert_eq!(out.sample_rate, 100);
        assert_eq!(storage.labels(), vec!["__name__"]);
    }

    #[test]
    fn test_empty_series() {
        let (storage, _dir) = create_test_storage();
        let out = get(&storage, "never.written{env=prod}", 0, 30);
        assert!(out.is_empty());
        assert_eq!(out.covered, None);
    }

    #[test]
    fn test_window_without_data() {
        let (storage, _dir) = create_test_storage();
        put(&storage, "app{}", 10, 19, &tree(&[("a", 1)]));
        let out = get(&storage, "app{}", 500, 600);
        assert!(out.is_empty());
        assert_eq!(out.covered, None);
    }

    #[test]
    fn test_invalid_time_range() {
        let (storage, _dir) = create_test_storage();
        let key = Key::parse("app{}").unwrap();
        let t = tree(&[("a", 1)]);

        let err = storage
            .put(PutInput::new(key.clone(), ts(20), ts(20), t))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTimeRange));

        let err = storage
            .get(GetInput::new(key, ts(30), ts(10)))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTimeRange));
    }

    #[test]
    fn test_dimension_membership_is_idempotent() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("a", 1)]);
        put(&storage, "app{env=prod,host=x}", 10, 19, &t);
        put(&storage, "app{env=prod,host=x}", 20, 29, &t);
        put(&storage, "app{env=prod,host=y}", 10, 19, &t);

        let prod = storage.series_matching(&[("env", "prod")]).unwrap();
        assert_eq!(prod, vec!["app{env=prod,host=x}", "app{env=prod,host=y}"]);

        let x = storage
            .series_matching(&[("env", "prod"), ("host", "x")])
            .unwrap();
        assert_eq!(x, vec!["app{env=prod,host=x}"]);

        assert!(storage.series_matching(&[("env", "dev")]).unwrap().is_empty());
    }

    #[test]
    fn test_get_values_short_circuits() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("a", 1)]);
        for env in ["dev", "prod", "staging"] {
            put(&storage, &format!("app{{env={}}}", env), 10, 19, &t);
        }

        let mut all = Vec::new();
        storage.get_values("env", |v| {
            all.push(v.to_string());
            true
        });
        assert_eq!(all, vec!["dev", "prod", "staging"]);

        let mut first = Vec::new();
        storage.get_values("env", |v| {
            first.push(v.to_string());
            false
        });
        assert_eq!(first, vec!["dev"]);

        assert_eq!(storage.labels(), vec!["__name__", "env"]);
    }

    #[test]
    fn test_expired_deadline_leaves_nothing_visible() {
        let (storage, _dir) = create_test_storage();
        let input = PutInput::new(
            Key::parse("app{env=prod}").unwrap(),
            ts(10),
            ts(19),
            tree(&[("a", 1)]),
        )
        .deadline(Instant::now());

        let err = storage.put(input).unwrap_err();
        assert!(matches!(err, StorageError::Timeout));
        assert!(get(&storage, "app{env=prod}", 0, 30).is_empty());
        assert!(storage.labels().is_empty());
        assert!(storage.series_matching(&[("env", "prod")]).unwrap().is_empty());

        let stats = storage.stats();
        assert_eq!(stats.segments, 0);
        assert_eq!(stats.dimensions, 0);
        assert_eq!(stats.trees, 0);
        // Only the append-only frame dictionary was written to
        assert_eq!(storage.flush().unwrap(), 1);
    }

    #[test]
    fn test_sub_second_window_is_kept() {
        let (storage, _dir) = create_test_storage();
        let key = Key::parse("app{}").unwrap();
        let from = Utc.timestamp_opt(10, 200_000_000).unwrap();
        let until = Utc.timestamp_opt(10, 800_000_000).unwrap();
        let t = tree(&[("a;b", 3)]);

        storage
            .put(PutInput::new(key.clone(), from, until, t.clone()))
            .unwrap();
        let out = get(&storage, "app{}", 0, 30);
        assert_eq!(out.tree.to_string(), t.to_string());

        let out = storage.get(GetInput::new(key.clone(), from, until)).unwrap();
        assert_eq!(out.tree.to_string(), t.to_string());
        assert_eq!(out.covered, Some((ts(10), ts(11))));

        let err = storage
            .put(PutInput::new(key, until, from, t))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTimeRange));
    }

    #[test]
    fn test_multi_year_put() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("main;work", 1_000_000), ("main;idle", 3)]);

        put(&storage, "app{}", 5, 1_700_000_003, &t);
        let out = get(&storage, "app{}", 0, 2_000_000_000);
        assert_eq!(out.tree.total(), t.total());
        assert!(storage.stats().trees < 200);

        // A window inside an undivided coarse chunk is answered from it
        let inner = get(&storage, "app{}", 500_000_000, 500_000_010);
        assert!(inner.tree.total() > 0);
    }

    #[test]
    fn test_eviction_writes_dictionary_before_chunks() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            cache_max_bytes: 1,
            ..StorageConfig::new(dir.path())
        };
        let storage = Storage::new(config).unwrap();

        put(&storage, "app{}", 0, 10, &tree(&[("a;b", 1)]));
        storage.flush().unwrap();
        put(&storage, "app{}", 10, 20, &tree(&[("a;newframe", 1)]));
        assert!(storage.evict().unwrap() > 0);

        // Crash: nothing is flushed on the way out
        std::mem::forget(storage);

        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        let out = get(&storage, "app{}", 0, 30);
        assert_eq!(
            out.tree.to_string(),
            tree(&[("a;b", 1), ("a;newframe", 1)]).to_string()
        );
    }

    #[test]
    fn test_failed_flush_retries_next_cycle() {
        let (storage, dir) = create_test_storage();
        put(&storage, "app{env=prod}", 10, 19, &tree(&[("a;b", 1)]));

        storage.kv.set_read_only(true).unwrap();
        assert!(storage.flush().is_err());
        assert!(storage.run_cycle().is_err());

        storage.kv.set_read_only(false).unwrap();
        storage.run_cycle().unwrap();
        assert_eq!(storage.flush().unwrap(), 0);

        drop(storage);
        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        assert_eq!(get(&storage, "app{env=prod}", 0, 30).tree.total(), 1);
        assert_eq!(storage.labels(), vec!["__name__", "env"]);
    }

    #[test]
    fn test_concurrent_puts_and_gets_see_whole_profiles() {
        let (storage, _dir) = create_test_storage();
        let t = tree(&[("main;a", 2), ("main;b", 4)]);
        let per_put = t.total();

        std::thread::scope(|s| {
            for writer in 0..4i64 {
                let (storage, t) = (&storage, &t);
                s.spawn(move || {
                    for i in 0..10 {
                        let start = (writer * 10 + i) * 10;
                        put(storage, "app{}", start, start + 10, t);
                    }
                });
            }
            for _ in 0..2 {
                let storage = &storage;
                s.spawn(move || {
                    for _ in 0..50 {
                        for (from, until) in [(0, 400), (0, 200), (50, 350)] {
                            let total = get(storage, "app{}", from, until).tree.total();
                            assert_eq!(total % per_put, 0, "torn read over [{}, {})", from, until);
                        }
                    }
                });
            }
        });

        assert_eq!(get(&storage, "app{}", 0, 400).tree.total(), 40 * per_put);
    }

    #[test]
    fn test_deepest_stack_on_small_thread() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let worker = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let storage = Storage::new(StorageConfig::new(&path)).unwrap();
                let stack = (0..crate::storage::tree::MAX_STACK_DEPTH)
                    .map(|i| format!("frame_{}", i))
                    .collect::<Vec<_>>()
                    .join(";");
                let t = Tree::from_collapsed(&format!("{} 5\n", stack)).unwrap();

                put(&storage, "app{}", 10, 19, &t);
                assert_eq!(get(&storage, "app{}", 0, 30).tree.total(), 5);
                storage.flush().unwrap();
                storage.close().unwrap();
                drop(storage);

                let storage = Storage::new(StorageConfig::new(&path)).unwrap();
                assert_eq!(get(&storage, "app{}", 0, 30).tree.to_string(), t.to_string());

                let too_deep = format!("{};one_more 1\n", stack);
                assert!(Tree::from_collapsed(&too_deep).is_err());
            })
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_eviction_keeps_data_retrievable() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            cache_max_bytes: 64 * 1024,
            ..StorageConfig::new(dir.path())
        };
        let storage = Storage::new(config).unwrap();

        let mut expected = Vec::new();
        for i in 0..32 {
            let key = format!("app{{series=s{:02}}}", i);
            let mut t = Tree::new();
            for f in 0..100 {
                t.insert_stack(&format!("main;handler_{};frame_{}_{}", i, f, "x".repeat(32)), f + 1)
                    .unwrap();
            }
            put(&storage, &key, 10, 19, &t);
            expected.push((key, t));
        }

        let before = storage.stats().resident_bytes;
        assert!(before > 64 * 1024);

        let freed = storage.evict().unwrap();
        assert!(freed > 0);
        let after = storage.stats();
        assert!(after.resident_bytes < before);
        assert!(after.trees < 32 * 8);

        for (key, t) in &expected {
            let out = get(&storage, key, 0, 30);
            assert_eq!(out.tree.to_string(), t.to_string(), "series {}", key);
        }
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (storage, _dir) = create_test_storage();
        put(&storage, "app{}", 10, 19, &tree(&[("a", 1)]));

        storage.close().unwrap();
        storage.close().unwrap();
        assert!(storage.is_closed());

        let err = storage
            .put(PutInput::new(
                Key::parse("app{}").unwrap(),
                ts(10),
                ts(19),
                tree(&[("a", 1)]),
            ))
            .unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[test]
    fn test_flush_clears_dirty_state() {
        let (storage, _dir) = create_test_storage();
        put(&storage, "app{env=prod}", 10, 19, &tree(&[("a;b", 1)]));

        // 8 level chunks + segment + dictionary + 2 dimensions
        assert_eq!(storage.flush().unwrap(), 12);
        assert_eq!(storage.flush().unwrap(), 0);
    }

    #[test]
    fn test_config_validation() {
        let config = StorageConfig {
            eviction_interval: Duration::ZERO,
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));

        let config = StorageConfig {
            resolution: Resolution {
                multiplier: 1,
                ..Resolution::default()
            },
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_background_eviction() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            cache_max_bytes: 1,
            eviction_interval: Duration::from_millis(20),
            ..StorageConfig::new(dir.path())
        };
        let storage = Arc::new(Storage::new(config).unwrap());
        let t = tree(&[("a;b", 1), ("a;c", 2)]);
        put(&storage, "app{}", 10, 19, &t);
        assert!(storage.stats().trees > 0);

        let handle = storage.start_background_eviction();

        let mut evicted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if storage.stats().trees == 0 {
                evicted = true;
                break;
            }
        }
        assert!(evicted);

        assert_eq!(get(&storage, "app{}", 0, 30).tree.to_string(), t.to_string());

        storage.close().unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
