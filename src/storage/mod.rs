//! Storage backends for the accumulated genotype counts and the derived statistics.

pub mod aggregation;
pub mod dir;
pub mod memory;
pub mod traits;

pub use self::{
    aggregation::{AggregationError, AggregationStore, Chunk, ChunkOutcome, MalformedPartial},
    dir::DirArrayStore,
    memory::MemoryArrayStore,
    traits::{ArrayStore, Dataset, DatasetExists, StorageError, StorageResult},
};
