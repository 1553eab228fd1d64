//! Migration engine for deployed game-configuration data.
//!
//! Upgrades persisted configuration instances across game-version baselines
//! in place, without discarding existing data. It handles:
//!
//! - Enumeration of the compiled-in patch catalog
//! - Resolving which units apply to an instance's baseline
//! - Ordering units that extend one another
//! - Idempotent, transactional application with a durable applied-ledger
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PatchRegistry                             │
//! │  - Enumerates the compiled-in catalog                           │
//! │  - Validates ids and the extends-graph at load time             │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Version Resolver                           │
//! │  - Filters by baseline, ledger and operator opt-in              │
//! │  - Orders by per-baseline version ordinal                       │
//! │  - Rejects undeclared same-version ties                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Chain Scheduler                            │
//! │  - Topological order over the extends-graph                     │
//! │  - Pulls in unapplied bases transitively                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MigrationRunner                            │
//! │  - One transaction scope per unit                               │
//! │  - Ledger record committed with the effect                      │
//! │  - Fail-fast halt, resumable from the ledger                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(PatchRegistry::load(catalog::all_patches())?);
//! let runner = MigrationRunner::new(registry, store);
//! for instance in instances {
//!     runner.run_instance(&instance, &PatchSelection::none())?;
//! }
//! ```
//!
//! Running the engine twice against the same instance is safe: the second
//! pass resolves to an empty plan. A pass that failed partway resumes at the
//! first unit absent from the ledger.

pub mod chain;
mod error;
mod registry;
pub mod resolver;
mod runner;

pub use error::MigrationError;
pub use registry::PatchRegistry;
pub use resolver::{resolve_applicable, PatchSelection};
pub use runner::{InstanceState, MigrationReport, MigrationRunner, MigrationStatus};
