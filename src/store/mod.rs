//! # Storage Contracts and Reference Backends
//!
//! This module contains the persistence contracts the engine depends on,
//! plus two backend pairs implementing them:
//!
//! - **`event_store`** / **`clock_store`**: the `EventStoreContract` and
//!   `VectorClockStoreContract` traits.
//! - **`memory`**: in-memory reference backends (`RwLock<HashMap>`, same
//!   shape as this codebase's thread-safe in-memory engine).
//! - **`sled_store`**: persistent backends over `sled`.
//!
//! All storage engines implement the same two traits, allowing the engine
//! to swap between them without changing its own code.

pub mod clock_store;
pub mod event_store;
pub mod memory;
pub mod sled_store;

pub use clock_store::VectorClockStoreContract;
pub use event_store::{EventStats, EventStoreContract};
pub use memory::{MemoryEventStore, MemoryVectorClockStore};
pub use sled_store::{SledEventStore, SledVectorClockStore};
