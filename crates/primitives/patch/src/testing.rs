//! In-memory [`ConfigStore`] for tests.
//!
//! Transactions buffer writes and commit them, together with any staged
//! ledger records, under a single lock, giving the joint-atomicity behavior
//! real stores provide. [`InMemoryStore::with_separate_ledger`] plus
//! [`InMemoryStore::inject_ledger_faults`] exercise the retry-until-durable
//! path of the engine.

use crate::store::{AppliedLedger, ConfigStore, LedgerAtomicity, StoreError, TransactionContext};
use crate::{AppliedRecord, InstanceId, PatchId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Shared {
    entities: HashMap<InstanceId, BTreeMap<String, Value>>,
    ledger: Vec<AppliedRecord>,
}

#[derive(Default, Clone)]
pub struct InMemoryStore {
    shared: Arc<Mutex<Shared>>,
    separate_ledger: bool,
    ledger_faults: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that cannot commit effect and ledger record atomically.
    pub fn with_separate_ledger() -> Self {
        Self { separate_ledger: true, ..Self::default() }
    }

    /// Fail the next `n` direct ledger writes with [`StoreError::LedgerWrite`].
    pub fn inject_ledger_faults(&self, n: usize) {
        self.ledger_faults.store(n, Ordering::SeqCst);
    }

    /// Seed an entity outside of any transaction.
    pub fn seed_entity(&self, instance: &InstanceId, key: &str, value: Value) {
        let mut shared = self.shared.lock().expect("store lock poisoned");
        shared.entities.entry(instance.clone()).or_default().insert(key.to_string(), value);
    }

    /// Full copy of an instance's entities, for before/after assertions.
    pub fn snapshot(&self, instance: &InstanceId) -> BTreeMap<String, Value> {
        let shared = self.shared.lock().expect("store lock poisoned");
        shared.entities.get(instance).cloned().unwrap_or_default()
    }

    pub fn applied_records(&self) -> Vec<AppliedRecord> {
        let shared = self.shared.lock().expect("store lock poisoned");
        shared.ledger.clone()
    }
}

/// Buffered transaction: reads see the overlay, commit applies it in one
/// lock scope, rollback just drops it.
struct InMemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    instance: InstanceId,
    // None marks a delete.
    writes: BTreeMap<String, Option<Value>>,
    records: Vec<AppliedRecord>,
}

impl TransactionContext for InMemoryTransaction {
    fn read_entity(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }
        let shared = self.shared.lock().expect("store lock poisoned");
        Ok(shared.entities.get(&self.instance).and_then(|m| m.get(key)).cloned())
    }

    fn write_entity(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete_entity(&mut self, key: &str) -> Result<(), StoreError> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    fn record_applied(&mut self, record: AppliedRecord) -> Result<(), StoreError> {
        self.records.push(record);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().expect("store lock poisoned");
        let entities = shared.entities.entry(self.instance.clone()).or_default();
        for (key, value) in self.writes {
            match value {
                Some(value) => {
                    entities.insert(key, value);
                }
                None => {
                    entities.remove(&key);
                }
            }
        }
        shared.ledger.extend(self.records);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl AppliedLedger for InMemoryStore {
    fn is_applied(&self, instance: &InstanceId, patch: &PatchId) -> Result<bool, StoreError> {
        let shared = self.shared.lock().expect("store lock poisoned");
        Ok(shared.ledger.iter().any(|r| &r.instance == instance && &r.patch == patch))
    }

    fn applied_ids(&self, instance: &InstanceId) -> Result<BTreeSet<PatchId>, StoreError> {
        let shared = self.shared.lock().expect("store lock poisoned");
        Ok(shared
            .ledger
            .iter()
            .filter(|r| &r.instance == instance)
            .map(|r| r.patch.clone())
            .collect())
    }

    fn record(&self, record: AppliedRecord) -> Result<(), StoreError> {
        let remaining = self.ledger_faults.load(Ordering::SeqCst);
        if remaining > 0 {
            self.ledger_faults.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::LedgerWrite("injected ledger fault".to_string()));
        }
        let mut shared = self.shared.lock().expect("store lock poisoned");
        shared.ledger.push(record);
        Ok(())
    }
}

impl ConfigStore for InMemoryStore {
    fn begin_context<'a>(
        &'a self,
        instance: &InstanceId,
    ) -> Result<Box<dyn TransactionContext + 'a>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            instance: instance.clone(),
            writes: BTreeMap::new(),
            records: Vec::new(),
        }))
    }

    fn ledger(&self) -> &dyn AppliedLedger {
        self
    }

    fn ledger_atomicity(&self) -> LedgerAtomicity {
        if self.separate_ledger {
            LedgerAtomicity::Separate
        } else {
            LedgerAtomicity::Joint
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_commit_applies_writes_and_records() {
        let store = InMemoryStore::new();
        let instance = InstanceId::new("world-1");

        let mut ctx = store.begin_context(&instance).unwrap();
        ctx.write_entity("drop_group.x", json!({ "entries": [] })).unwrap();
        ctx.record_applied(AppliedRecord::new(instance.clone(), PatchId::from("u075"))).unwrap();
        ctx.commit().unwrap();

        assert_eq!(store.snapshot(&instance).len(), 1);
        assert!(store.is_applied(&instance, &PatchId::from("u075")).unwrap());
    }

    #[test]
    fn test_rollback_drops_everything() {
        let store = InMemoryStore::new();
        let instance = InstanceId::new("world-1");
        store.seed_entity(&instance, "drop_group.x", json!({ "entries": ["a"] }));
        let before = store.snapshot(&instance);

        let mut ctx = store.begin_context(&instance).unwrap();
        ctx.write_entity("drop_group.x", json!({ "entries": [] })).unwrap();
        ctx.write_entity("drop_group.y", json!({})).unwrap();
        ctx.record_applied(AppliedRecord::new(instance.clone(), PatchId::from("u075"))).unwrap();
        ctx.rollback().unwrap();

        assert_eq!(store.snapshot(&instance), before);
        assert!(store.applied_records().is_empty());
    }

    #[test]
    fn test_transaction_reads_see_overlay() {
        let store = InMemoryStore::new();
        let instance = InstanceId::new("world-1");
        store.seed_entity(&instance, "k", json!(1));

        let mut ctx = store.begin_context(&instance).unwrap();
        assert_eq!(ctx.read_entity("k").unwrap(), Some(json!(1)));
        ctx.write_entity("k", json!(2)).unwrap();
        assert_eq!(ctx.read_entity("k").unwrap(), Some(json!(2)));
        ctx.delete_entity("k").unwrap();
        assert_eq!(ctx.read_entity("k").unwrap(), None);
    }

    #[test]
    fn test_ledger_fault_injection() {
        let store = InMemoryStore::with_separate_ledger();
        let instance = InstanceId::new("world-1");
        store.inject_ledger_faults(1);

        let record = AppliedRecord::new(instance.clone(), PatchId::from("u075"));
        assert_matches!(
            store.ledger().record(record.clone()),
            Err(StoreError::LedgerWrite(_))
        );
        store.ledger().record(record).unwrap();
        assert!(store.is_applied(&instance, &PatchId::from("u075")).unwrap());
    }
}
