//! Local persistence of captured chunks
//!
//! Durable chunk stores, storage headroom estimates and the backpressure
//! controller that aborts capture when storage runs out.

pub mod controller;
pub mod quota;
pub mod signal;
pub mod store;

pub use controller::{PersistenceController, PersistenceStats};
pub use quota::{DirectoryEstimate, ReportedEstimate, StorageEstimate, StorageEstimator};
pub use signal::{AbortReason, AbortSignal};
pub use store::{ChunkRecord, ChunkStore, FileChunkStore, MemoryChunkStore};
