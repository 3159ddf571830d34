//! Multi-resolution time index for one series
//!
//! A segment keeps one ordered list of chunk start times per level. Level
//! `i` chunks are `base × multiplier^i` seconds long and aligned to
//! multiples of that duration, so every coarse chunk is exactly tiled by
//! the chunks of the level below it:
//!
//! ```text
//! level 2  [0 ─────────────────────────────────────── 1000)
//! level 1  [0 ──── 100) [100 ── 200) ...   [900 ──── 1000)
//! level 0  [0─10)[10─20) ...
//! ```
//!
//! Writes land at every level down to the chunks they only partly overlap
//! (see [`Resolution::plan`]); reads pick the fewest, coarsest chunks that
//! tile the requested window (see [`Segment::cover`]).

use crate::storage::cache::Persist;
use crate::storage::codec::Kind;
use crate::storage::error::{check_deadline, StorageError, StorageResult};
use crate::storage::tree::ChunkTree;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Most top-level chunks a single write may span
const MAX_TOP_CHUNKS: i64 = 1 << 16;

/// Chunk duration layout shared by all levels of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Level 0 chunk duration in seconds
    pub base_secs: i64,
    /// Duration growth factor between adjacent levels
    pub multiplier: i64,
    /// Number of levels
    pub levels: u8,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            base_secs: 10,
            multiplier: 10,
            levels: 8,
        }
    }
}

impl Resolution {
    /// Reject layouts that cannot tile time or overflow at the top level
    pub fn validate(&self) -> StorageResult<()> {
        if self.base_secs <= 0 {
            return Err(StorageError::Config(
                "base resolution must be positive".to_string(),
            ));
        }
        if self.multiplier < 2 {
            return Err(StorageError::Config(
                "resolution multiplier must be at least 2".to_string(),
            ));
        }
        if self.levels == 0 {
            return Err(StorageError::Config(
                "at least one level is required".to_string(),
            ));
        }
        self.multiplier
            .checked_pow(self.levels as u32 - 1)
            .and_then(|m| m.checked_mul(self.base_secs))
            .ok_or_else(|| {
                StorageError::Config(format!(
                    "{} levels of x{} overflow the time range",
                    self.levels, self.multiplier
                ))
            })?;
        Ok(())
    }

    /// Chunk duration of a level in seconds
    pub fn duration(&self, level: u8) -> i64 {
        self.base_secs * self.multiplier.pow(level as u32)
    }

    /// Start of the level chunk containing `t`
    pub fn align(&self, level: u8, t: i64) -> i64 {
        let d = self.duration(level);
        t.div_euclid(d) * d
    }

    /// Apportion a tree written over `[start, end)` to chunks
    ///
    /// Walking down from the coarsest level, the samples are spread over
    /// the chunks the interval overlaps, weighted by overlap length. A chunk
    /// the interval covers completely keeps its share whole and is marked
    /// [`Placement::undivided`]; only partly covered chunks pass their share
    /// on to the next finer level. A chunk therefore equals the sum of its
    /// children unless it is undivided, and the work per write is bounded
    /// by the number of levels rather than the length of the interval.
    /// Chunks that would receive no samples are left out.
    pub fn plan(
        &self,
        start: i64,
        end: i64,
        tree: &ChunkTree,
        deadline: Option<Instant>,
    ) -> StorageResult<Vec<Placement>> {
        if end <= start {
            return Err(StorageError::InvalidTimeRange);
        }
        let top = self.levels - 1;
        let top_duration = self.duration(top);
        let span = (end - 1).div_euclid(top_duration) - start.div_euclid(top_duration) + 1;
        if span > MAX_TOP_CHUNKS {
            return Err(StorageError::InvalidTimeRange);
        }

        let mut placements = Vec::new();
        self.plan_level(top, start, end, tree, deadline, &mut placements)?;
        Ok(placements)
    }

    fn plan_level(
        &self,
        level: u8,
        start: i64,
        end: i64,
        tree: &ChunkTree,
        deadline: Option<Instant>,
        out: &mut Vec<Placement>,
    ) -> StorageResult<()> {
        check_deadline(deadline)?;

        let duration = self.duration(level);
        let mut chunks = Vec::new();
        let mut weights = Vec::new();
        let mut chunk_start = self.align(level, start);
        while chunk_start < end {
            let chunk = ChunkRef {
                level,
                start: chunk_start,
                end: chunk_start + duration,
            };
            weights.push((chunk.end.min(end) - chunk.start.max(start)) as u64);
            chunks.push(chunk);
            chunk_start += duration;
        }

        for (chunk, part) in chunks.into_iter().zip(tree.split(&weights)) {
            if part.is_empty() {
                continue;
            }
            let whole = chunk.is_within(start, end);
            if level > 0 && !whole {
                self.plan_level(
                    level - 1,
                    chunk.start.max(start),
                    chunk.end.min(end),
                    &part,
                    deadline,
                    out,
                )?;
            }
            out.push(Placement {
                chunk,
                tree: part,
                undivided: level > 0 && whole,
            });
        }
        Ok(())
    }
}

/// One chunk of one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRef {
    pub level: u8,
    /// Inclusive start, unix seconds
    pub start: i64,
    /// Exclusive end, unix seconds
    pub end: i64,
}

impl ChunkRef {
    /// Cache / store id of the chunk's tree within a series
    pub fn tree_id(&self, series: &str) -> String {
        format!("{}:{}:{}", series, self.level, self.start)
    }

    fn is_within(&self, start: i64, end: i64) -> bool {
        self.start >= start && self.end <= end
    }
}

/// A chunk and the tree to merge into it
#[derive(Debug, Clone)]
pub struct Placement {
    pub chunk: ChunkRef,
    pub tree: ChunkTree,
    /// The samples were not passed on to finer levels
    pub undivided: bool,
}

/// Per-series time index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    resolution: Resolution,
    /// Sorted chunk starts, one list per level
    levels: Vec<Vec<i64>>,
    /// Sorted starts of chunks holding samples their children lack
    undivided: Vec<Vec<i64>>,
    spy_name: String,
    sample_rate: u32,
}

impl Segment {
    /// Create an empty segment
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            levels: vec![Vec::new(); resolution.levels as usize],
            undivided: vec![Vec::new(); resolution.levels as usize],
            spy_name: String::new(),
            sample_rate: 0,
        }
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn spy_name(&self) -> &str {
        &self.spy_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Record the profiler that produced the series
    pub fn set_metadata(&mut self, spy_name: &str, sample_rate: u32) {
        if self.spy_name != spy_name {
            self.spy_name = spy_name.to_string();
        }
        self.sample_rate = sample_rate;
    }

    /// True when no chunk has been written
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(Vec::is_empty)
    }

    /// Number of chunks at a level
    pub fn chunk_count(&self, level: u8) -> usize {
        self.levels.get(level as usize).map(Vec::len).unwrap_or(0)
    }

    /// Earliest start and latest end of stored data
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let finest = self.levels.first()?;
        let first = *finest.first()?;
        let last = *finest.last()?;
        Some((first, last + self.resolution.duration(0)))
    }

    fn chunk(&self, level: u8, start: i64) -> ChunkRef {
        ChunkRef {
            level,
            start,
            end: start + self.resolution.duration(level),
        }
    }

    /// Register a chunk planned by [`Resolution::plan`] once its tree has
    /// been merged
    pub fn record(&mut self, placement: &Placement) {
        self.insert(placement.chunk);
        if placement.undivided {
            if let Some(starts) = self.undivided.get_mut(placement.chunk.level as usize) {
                insert_sorted(starts, placement.chunk.start);
            }
        }
    }

    fn is_undivided(&self, chunk: &ChunkRef) -> bool {
        self.undivided
            .get(chunk.level as usize)
            .is_some_and(|starts| starts.binary_search(&chunk.start).is_ok())
    }

    /// Register a chunk as holding data
    ///
    /// Returns false if it was already present.
    pub fn insert(&mut self, chunk: ChunkRef) -> bool {
        match self.levels.get_mut(chunk.level as usize) {
            Some(starts) => insert_sorted(starts, chunk.start),
            None => false,
        }
    }

    /// Minimal set of stored chunks covering `[start, end)`, in time order
    ///
    /// Starting from the coarsest level, chunks lying entirely inside the
    /// window are taken whole and chunks straddling an edge are refined at
    /// the next finer level. A straddling chunk is taken whole when it is
    /// at level 0 or holds samples its children lack.
    pub fn cover(&self, start: i64, end: i64) -> Vec<ChunkRef> {
        let mut out = Vec::new();
        if end > start && self.resolution.levels > 0 {
            self.cover_level(self.resolution.levels - 1, start, end, &mut out);
        }
        out
    }

    fn cover_level(&self, level: u8, start: i64, end: i64, out: &mut Vec<ChunkRef>) {
        let duration = self.resolution.duration(level);
        let starts = &self.levels[level as usize];
        let first = starts.partition_point(|&s| s + duration <= start);

        for &chunk_start in starts[first..].iter().take_while(|&&s| s < end) {
            let chunk = self.chunk(level, chunk_start);
            if level == 0 || chunk.is_within(start, end) || self.is_undivided(&chunk) {
                out.push(chunk);
            } else {
                self.cover_level(level - 1, chunk.start.max(start), chunk.end.min(end), out);
            }
        }
    }
}

/// Insert into a sorted list; false if already present
fn insert_sorted(starts: &mut Vec<i64>, start: i64) -> bool {
    // Fast path: ingestion is mostly in time order
    if starts.last().map_or(true, |&last| last < start) {
        starts.push(start);
        return true;
    }

    match starts.binary_search(&start) {
        Ok(_) => false,
        Err(pos) => {
            starts.insert(pos, start);
            true
        }
    }
}

impl Persist for Segment {
    const KIND: Kind = Kind::Segment;

    fn size_hint(&self) -> usize {
        let chunks: usize = self.levels.iter().chain(&self.undivided).map(Vec::len).sum();
        chunks * 8 + self.spy_name.len() + 128
    }
}
