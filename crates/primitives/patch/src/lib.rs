//! Reforge patch primitives.
//!
//! This crate defines the identity types and data records shared by the
//! migration engine and by patch catalogs:
//!
//! - [`PatchId`], [`BaselineKey`], [`InstanceId`]: string newtypes for the
//!   three identity spaces of the system.
//! - [`PatchUnit`]: an immutable, self-describing migration step bound to a
//!   baseline and a per-baseline version ordinal.
//! - [`ConfigurationInstance`]: a live persisted configuration, permanently
//!   bound to the baseline it was created from.
//! - [`AppliedRecord`]: the append-only ledger entry marking durable
//!   completion of a unit against an instance.
//! - The persistence collaborator seam ([`store`]): transaction contexts,
//!   the applied-ledger contract, and the atomicity mode the engine uses to
//!   decide how ledger records are committed.
//!
//! The storage format behind the [`store::ConfigStore`] trait is not defined
//! here; hosts plug in their own persistence engine. An in-memory store for
//! tests is available behind the `testing` feature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod store;
mod unit;

#[cfg(feature = "testing")]
pub mod testing;

pub use store::{AppliedLedger, ConfigStore, LedgerAtomicity, StoreError, TransactionContext};
pub use unit::{EffectError, PatchEffect, PatchUnit};

/// Globally unique identifier of a patch unit.
///
/// Ids are never reused across releases: once a unit has shipped under an id,
/// that id permanently refers to that unit's effect semantics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(String);

impl PatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PatchId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PatchId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a named starting data snapshot (e.g. `"Version075"`).
///
/// The snapshot itself is supplied by an external data-initialization
/// registry; the engine only matches on the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaselineKey(String);

impl BaselineKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BaselineKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for BaselineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a live configuration instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live persisted configuration undergoing migration.
///
/// The baseline binding is permanent: it is set when the instance is created
/// and never changes afterwards. All mutation of the instance's data goes
/// through a [`store::TransactionContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationInstance {
    id: InstanceId,
    baseline: BaselineKey,
}

impl ConfigurationInstance {
    pub fn new(id: impl Into<InstanceId>, baseline: impl Into<BaselineKey>) -> Self {
        Self { id: id.into(), baseline: baseline.into() }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn baseline(&self) -> &BaselineKey {
        &self.baseline
    }
}

/// Append-only ledger entry: patch `patch` durably committed against
/// instance `instance`. Entries are never deleted or reapplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub instance: InstanceId,
    pub patch: PatchId,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn new(instance: InstanceId, patch: PatchId) -> Self {
        Self { instance, patch, applied_at: Utc::now() }
    }
}
