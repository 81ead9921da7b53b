//! # cpg-store - Persistence ports for the process engine
//!
//! Trait-based store abstractions and in-memory reference implementations
//! for the three kinds of state the engine shares across steps:
//!
//! - [`GraphStore`] - read-only graph templates keyed by `(id, version)`
//! - [`InstanceStore`] - instance records with optimistic
//!   compare-and-swap on a monotonic version
//! - [`TraceStore`] - append-only decision traces, totally ordered within
//!   an instance, with retention pruning
//!
//! The in-memory implementations ([`InMemoryGraphStore`],
//! [`InMemoryInstanceStore`], [`InMemoryTraceStore`]) are the reference for
//! the concurrency contract: per-instance serializability and atomic
//! version checks. Production backends implement the same traits against a
//! database; the engine does not care which is plugged in.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cpg_core::context::ExecutionContext;
//! use cpg_core::instance::ProcessInstance;
//! use cpg_store::{InMemoryInstanceStore, InstanceStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryInstanceStore::new();
//!
//!     let mut instance = ProcessInstance::new("onboarding", 1, ExecutionContext::default());
//!     instance.version = store.save(&instance).await?;
//!
//!     let loaded = store.load(&instance.instance_id).await?;
//!     assert_eq!(loaded.version, 1);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{InMemoryGraphStore, InMemoryInstanceStore, InMemoryTraceStore};
pub use traits::{GraphStore, InstanceStore, TraceStore};
