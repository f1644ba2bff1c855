//! Local storage for cache entries and its collaborator seams.

mod data;
mod locks;
mod store;

pub use data::DataContainer;
pub use locks::{InMemoryLockManager, LockManager};
pub use store::{InMemorySegmentStore, NoStore, SegmentStore};
