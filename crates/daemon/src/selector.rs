//! Content selection with rotation avoidance.
//!
//! Picks a random item from a fixed-size catalog while avoiding recent
//! repeats. The recently-played set is cleared wholesale once it reaches
//! capacity; with capacity strictly below the catalog size (asserted in the
//! startup checks) the redraw loop always terminates.

use loopcast_config::LibraryConfig;
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Identifier of one catalog item; ids are the contiguous range [0, catalog_size).
pub type ContentId = u32;

/// Error type for content selection
#[derive(Debug, Error)]
pub enum SelectError {
    /// The chosen item does not exist on disk. No fallback is attempted;
    /// the caller decides whether this consumes a restart attempt.
    #[error("Content {id} not found at {path}: {source}")]
    NotFound {
        id: ContentId,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Source of uniform random indices, injectable for tests
pub trait IndexSource: Send {
    /// Draw a value in [0, bound)
    fn draw(&mut self, bound: u32) -> u32;
}

/// Production index source backed by the thread-local RNG
pub struct RandomSource;

impl IndexSource for RandomSource {
    fn draw(&mut self, bound: u32) -> u32 {
        rand::rng().random_range(0..bound)
    }
}

/// One successfully selected catalog item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedContent {
    pub id: ContentId,
    pub path: PathBuf,
}

/// Picks catalog items, avoiding recent repeats
pub struct Selector<S: IndexSource> {
    library_dir: PathBuf,
    file_pattern: String,
    catalog_size: u32,
    rotation_capacity: u32,
    recent: HashSet<ContentId>,
    source: S,
}

impl<S: IndexSource> Selector<S> {
    /// Create a selector over the configured library
    pub fn new(library: &LibraryConfig, source: S) -> Self {
        Self {
            library_dir: library.dir.clone(),
            file_pattern: library.file_pattern.clone(),
            catalog_size: library.catalog_size,
            rotation_capacity: library.rotation_capacity,
            recent: HashSet::new(),
            source,
        }
    }

    /// Resolve the on-disk path for a content id
    pub fn content_path(&self, id: ContentId) -> PathBuf {
        self.library_dir
            .join(self.file_pattern.replace("{index}", &id.to_string()))
    }

    /// Number of items currently in the recently-played set
    pub fn recently_played(&self) -> usize {
        self.recent.len()
    }

    /// Pick a content item: draw, verify it exists, record it as played.
    ///
    /// Draws uniformly from the catalog and redraws while the id is in the
    /// recently-played set. The chosen file must exist; an inaccessible file
    /// is an error, never a silent fallback to another item.
    pub async fn pick(&mut self) -> Result<PickedContent, SelectError> {
        let id = self.draw_fresh();
        let path = self.content_path(id);

        tokio::fs::metadata(&path)
            .await
            .map_err(|source| SelectError::NotFound {
                id,
                path: path.clone(),
                source,
            })?;

        debug!(content = id, "selected content");
        self.note_played(id);

        Ok(PickedContent { id, path })
    }

    /// Draw an id that is not in the recently-played set.
    ///
    /// Terminates because the set holds strictly fewer ids than the catalog:
    /// its size stays below rotation_capacity, which the startup checks
    /// require to be below catalog_size.
    fn draw_fresh(&mut self) -> ContentId {
        loop {
            let id = self.source.draw(self.catalog_size);
            if self.rotation_capacity == 0 || !self.recent.contains(&id) {
                return id;
            }
        }
    }

    /// Record a played id; clear the whole set once it reaches capacity.
    fn note_played(&mut self, id: ContentId) {
        if self.rotation_capacity == 0 {
            return;
        }
        self.recent.insert(id);
        if self.recent.len() as u32 >= self.rotation_capacity {
            info!(
                played = self.recent.len(),
                "rotation window full, clearing recently played set"
            );
            self.recent.clear();
        }
    }
}
