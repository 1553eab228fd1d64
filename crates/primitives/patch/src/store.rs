//! Persistence collaborator seam.
//!
//! The engine never talks to a storage engine directly. Hosts implement
//! [`ConfigStore`] over whatever persistence they use; the engine only relies
//! on the contracts below:
//!
//! - every unit effect runs inside a scoped [`TransactionContext`] that
//!   either commits fully or rolls back fully;
//! - the applied ledger is append-only and is read before resolving;
//! - when the store can commit entity writes and ledger records in one
//!   atomic scope ([`LedgerAtomicity::Joint`]), the record is written through
//!   the same transaction as the effect. When it cannot
//!   ([`LedgerAtomicity::Separate`]), the engine retries the ledger write
//!   until durable rather than leaving a committed effect unrecorded.

use crate::{AppliedRecord, InstanceId, PatchId};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("transaction context already closed")]
    TransactionClosed,

    #[error("ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("entity codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Whether the backing store can commit a unit's entity writes and its
/// applied-ledger record within one atomic scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAtomicity {
    /// Effect and ledger record commit together; a crash can never separate
    /// them.
    Joint,
    /// The ledger lives outside the transaction scope; records are written
    /// after the effect commits and must be retried until durable.
    Separate,
}

/// Scoped transaction over one configuration instance's entities.
///
/// Entity payloads are opaque JSON values; the engine does not interpret
/// them. `commit`/`rollback` consume the context, so a closed transaction
/// cannot be reused.
pub trait TransactionContext {
    fn read_entity(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn write_entity(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    fn delete_entity(&mut self, key: &str) -> Result<(), StoreError>;

    /// Stage an applied-ledger record to be committed atomically with the
    /// entity writes of this transaction. Only meaningful for stores
    /// reporting [`LedgerAtomicity::Joint`].
    fn record_applied(&mut self, record: AppliedRecord) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable record of which units have been committed against which instance.
pub trait AppliedLedger: Send + Sync {
    fn is_applied(&self, instance: &InstanceId, patch: &PatchId) -> Result<bool, StoreError>;

    /// All patch ids recorded for `instance`.
    fn applied_ids(&self, instance: &InstanceId) -> Result<BTreeSet<PatchId>, StoreError>;

    /// Durably append a record. Used directly by the engine only for
    /// [`LedgerAtomicity::Separate`] stores; joint stores receive records
    /// through [`TransactionContext::record_applied`].
    fn record(&self, record: AppliedRecord) -> Result<(), StoreError>;
}

/// The persistence engine a host plugs into the migration runner.
pub trait ConfigStore: Send + Sync {
    fn begin_context<'a>(
        &'a self,
        instance: &InstanceId,
    ) -> Result<Box<dyn TransactionContext + 'a>, StoreError>;

    fn ledger(&self) -> &dyn AppliedLedger;

    fn ledger_atomicity(&self) -> LedgerAtomicity {
        LedgerAtomicity::Joint
    }
}
