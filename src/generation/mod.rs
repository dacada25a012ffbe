use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::store::{CounterStore, StoreError, CURRENT_GENERATION_KEY};

/// Two-valued label partitioning the counter keyspace into an actively
/// written half and a draining half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    A,
    B,
}

impl Generation {
    pub fn as_str(self) -> &'static str {
        match self {
            Generation::A => "A",
            Generation::B => "B",
        }
    }

    /// The opposite label.
    pub fn other(self) -> Self {
        match self {
            Generation::A => Generation::B,
            Generation::B => Generation::A,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Generation::A),
            "B" => Some(Generation::B),
            _ => None,
        }
    }

    fn from_slot(raw: u8) -> Self {
        if raw == 0 {
            Generation::A
        } else {
            Generation::B
        }
    }

    fn to_slot(self) -> u8 {
        match self {
            Generation::A => 0,
            Generation::B => 1,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the `current_generation` KV key and a process-local cached copy.
///
/// Every ingest worker reads the cache on every increment, so it is a single
/// atomic slot rather than a lock. Only the forwarder writes it, through
/// `toggle`.
pub struct GenerationManager {
    store: Arc<dyn CounterStore>,
    current: AtomicU8,
}

impl GenerationManager {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            current: AtomicU8::new(Generation::A.to_slot()),
        }
    }

    /// Lock-free read of the cached label.
    pub fn current(&self) -> Generation {
        Generation::from_slot(self.current.load(Ordering::Relaxed))
    }

    /// Synchronizes the cache from the KV at startup, seeding "A" when the
    /// key is absent. Failure here aborts service construction.
    pub async fn load(&self) -> Result<Generation, StoreError> {
        self.get_current().await
    }

    /// Reads the label from the KV. An absent key is atomically seeded with
    /// "A"; a value that is neither "A" nor "B" is an error, because draining
    /// an unknown keyspace half would lose counters.
    pub async fn get_current(&self) -> Result<Generation, StoreError> {
        let generation = match self.store.get(CURRENT_GENERATION_KEY).await? {
            Some(raw) => Generation::parse(&raw).ok_or_else(|| StoreError::InvalidValue {
                key: CURRENT_GENERATION_KEY.to_string(),
                value: raw,
            })?,
            None => {
                self.store
                    .set(CURRENT_GENERATION_KEY, Generation::A.as_str())
                    .await?;
                Generation::A
            }
        };

        self.current.store(generation.to_slot(), Ordering::Relaxed);
        Ok(generation)
    }

    /// Flips the label: writes the opposite of the cached value to the KV,
    /// then updates the cache. On write failure the cache is left unchanged
    /// and the caller must abort its flush cycle.
    pub async fn toggle(&self) -> Result<Generation, StoreError> {
        let next = self.current().other();

        self.store
            .set(CURRENT_GENERATION_KEY, next.as_str())
            .await?;
        self.current.store(next.to_slot(), Ordering::Relaxed);

        Ok(next)
    }
}
