//! Sequential transactional apply runner.
//!
//! One pass migrates one configuration instance: resolve the applicable
//! units against the baseline and the applied-ledger, schedule them over the
//! extends-graph, then apply them in order, each inside its own transaction
//! scope. A unit's effect and its applied-ledger record commit in the same
//! atomic scope, so a crash can never leave a committed effect unrecorded
//! (stores without joint atomicity get the record retried until durable
//! instead).
//!
//! Failure is fail-fast: the failing unit's transaction rolls back, prior
//! records stay untouched, and the remaining units are abandoned. A later
//! run re-resolves against the ledger and resumes at the first unrecorded
//! unit; committed units are never re-executed.
//!
//! Independent instances may be migrated concurrently (the runner takes
//! `&self` and shares no per-instance state); concurrent passes over the
//! *same* instance are not supported.

use crate::chain::schedule;
use crate::resolver::{resolve_applicable, PatchSelection};
use crate::{MigrationError, PatchRegistry};
use chrono::{DateTime, Utc};
use rp_patch::{
    AppliedLedger, AppliedRecord, ConfigStore, ConfigurationInstance, InstanceId, LedgerAtomicity,
    PatchId, PatchUnit,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cap for the ledger-retry backoff.
const MAX_LEDGER_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Per-instance migration state for one run. `Applied` and `Failed` are
/// terminal for the run; `Failed` is safely resumable by a later run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Pending,
    Resolving,
    Applying(usize),
    Applied,
    /// Terminal failure at unit `at`. A failed run surfaces as an `Err`
    /// from [`MigrationRunner::run_instance`] rather than a report, so
    /// this state reaches the host through the error's `at_index` (see
    /// [`crate::MigrationError::PatchApplyFailed`]); intermediate
    /// transitions are logged at debug level.
    Failed { at: usize },
}

/// Result of a status check, without running anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Nothing to apply for this instance.
    UpToDate,
    /// Units that would be applied, in execution order.
    MigrationRequired { pending: Vec<PatchId> },
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub instance: InstanceId,
    /// Units committed during this run, in execution order. Empty when the
    /// instance was already up to date.
    pub applied: Vec<PatchId>,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Main migration orchestrator.
pub struct MigrationRunner<S> {
    registry: Arc<PatchRegistry>,
    store: S,
    abort_flag: Arc<AtomicBool>,
}

impl<S: ConfigStore> MigrationRunner<S> {
    pub fn new(registry: Arc<PatchRegistry>, store: S) -> Self {
        Self { registry, store, abort_flag: Arc::new(AtomicBool::new(false)) }
    }

    /// Signal the runner to stop before the next unit. Never interrupts a
    /// unit mid-transaction.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::Relaxed);
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check what a run would do, without touching the instance.
    pub fn check_status(
        &self,
        instance: &ConfigurationInstance,
        selection: &PatchSelection,
    ) -> Result<MigrationStatus, MigrationError> {
        let plan = self.resolve_plan(instance, selection)?;
        if plan.is_empty() {
            Ok(MigrationStatus::UpToDate)
        } else {
            Ok(MigrationStatus::MigrationRequired {
                pending: plan.iter().map(|u| u.id().clone()).collect(),
            })
        }
    }

    /// Run the migration pass for one instance.
    ///
    /// Sequential and single-threaded per instance; each unit commits or
    /// rolls back atomically. On error the instance halts at the failing
    /// unit with everything before it durably recorded.
    pub fn run_instance(
        &self,
        instance: &ConfigurationInstance,
        selection: &PatchSelection,
    ) -> Result<MigrationReport, MigrationError> {
        let started_at = Utc::now();
        self.transition(instance.id(), &InstanceState::Pending);

        self.transition(instance.id(), &InstanceState::Resolving);
        let plan = self.resolve_plan(instance, selection)?;

        if plan.is_empty() {
            tracing::debug!(
                "✅ instance '{}' is up to date for baseline '{}'",
                instance.id(),
                instance.baseline()
            );
            self.transition(instance.id(), &InstanceState::Applied);
            return Ok(MigrationReport {
                instance: instance.id().clone(),
                applied: vec![],
                state: InstanceState::Applied,
                started_at,
                finished_at: Utc::now(),
            });
        }

        tracing::info!(
            "🔄 migrating instance '{}' (baseline '{}'): {} unit(s) to apply",
            instance.id(),
            instance.baseline(),
            plan.len()
        );

        let mut applied = Vec::with_capacity(plan.len());
        for (index, unit) in plan.iter().enumerate() {
            if self.abort_flag.load(Ordering::Relaxed) {
                tracing::warn!(
                    "⚠️  migration aborted on instance '{}' before unit {}",
                    instance.id(),
                    index
                );
                return Err(MigrationError::Aborted {
                    instance: instance.id().clone(),
                    at_index: index,
                });
            }

            self.transition(instance.id(), &InstanceState::Applying(index));
            tracing::info!(
                "📦 applying patch '{}' ({}) to instance '{}'",
                unit.id(),
                unit.display_name(),
                instance.id()
            );
            let start = Instant::now();

            if let Err(err) = self.apply_unit(unit, instance, index) {
                self.transition(instance.id(), &InstanceState::Failed { at: index });
                tracing::error!(
                    "❌ patch '{}' failed on instance '{}': {err}",
                    unit.id(),
                    instance.id()
                );
                return Err(err);
            }

            tracing::info!(
                "✅ patch '{}' applied in {:.2}s",
                unit.id(),
                start.elapsed().as_secs_f64()
            );
            applied.push(unit.id().clone());
        }

        self.transition(instance.id(), &InstanceState::Applied);
        tracing::info!(
            "🎉 instance '{}' migrated successfully: {} unit(s) applied",
            instance.id(),
            applied.len()
        );

        Ok(MigrationReport {
            instance: instance.id().clone(),
            applied,
            state: InstanceState::Applied,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Resolve and schedule the units this pass would apply.
    fn resolve_plan(
        &self,
        instance: &ConfigurationInstance,
        selection: &PatchSelection,
    ) -> Result<Vec<Arc<PatchUnit>>, MigrationError> {
        let applied = self.store.ledger().applied_ids(instance.id())?;
        let applicable =
            resolve_applicable(&self.registry, instance.baseline(), &applied, selection)?;
        schedule(&self.registry, &applicable, &applied)
    }

    /// Apply one unit inside its own transaction scope.
    fn apply_unit(
        &self,
        unit: &PatchUnit,
        instance: &ConfigurationInstance,
        at_index: usize,
    ) -> Result<(), MigrationError> {
        let mut ctx = self.store.begin_context(instance.id())?;

        if let Err(effect_err) = unit.apply(ctx.as_mut(), instance) {
            if let Err(rollback_err) = ctx.rollback() {
                tracing::warn!(
                    "rollback failed after patch '{}' error on instance '{}': {rollback_err}",
                    unit.id(),
                    instance.id()
                );
            }
            return Err(MigrationError::PatchApplyFailed {
                patch: unit.id().clone(),
                instance: instance.id().clone(),
                at_index,
                message: effect_err.to_string(),
            });
        }

        let record = AppliedRecord::new(instance.id().clone(), unit.id().clone());
        match self.store.ledger_atomicity() {
            LedgerAtomicity::Joint => {
                // Effect and ledger record commit in one atomic scope. If
                // the record cannot even be staged, the whole transaction is
                // rolled back so the effect never outlives its record.
                if let Err(source) = ctx.record_applied(record) {
                    if let Err(rollback_err) = ctx.rollback() {
                        tracing::warn!(
                            "rollback failed after ledger staging error for patch '{}' \
                             on instance '{}': {rollback_err}",
                            unit.id(),
                            instance.id()
                        );
                    }
                    return Err(MigrationError::CommitFailed {
                        patch: unit.id().clone(),
                        instance: instance.id().clone(),
                        source,
                    });
                }
                ctx.commit().map_err(|source| MigrationError::CommitFailed {
                    patch: unit.id().clone(),
                    instance: instance.id().clone(),
                    source,
                })?;
            }
            LedgerAtomicity::Separate => {
                ctx.commit().map_err(|source| MigrationError::CommitFailed {
                    patch: unit.id().clone(),
                    instance: instance.id().clone(),
                    source,
                })?;
                // The effect is committed; the record must become durable,
                // whatever it takes.
                self.record_until_durable(record, unit.id(), instance.id());
            }
        }
        Ok(())
    }

    /// Retry a ledger write until it sticks. Giving up here would leave a
    /// committed effect unrecorded, which a later run would re-execute.
    fn record_until_durable(&self, record: AppliedRecord, patch: &PatchId, instance: &InstanceId) {
        let mut backoff = Duration::from_millis(50);
        let mut attempt = 1u32;
        loop {
            match self.store.ledger().record(record.clone()) {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(
                        "⚠️  ledger write for patch '{patch}' on instance '{instance}' \
                         failed (attempt {attempt}): {err}; retrying in {backoff:?}"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_LEDGER_RETRY_BACKOFF);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn transition(&self, instance: &InstanceId, state: &InstanceState) {
        tracing::debug!("instance '{instance}' -> {state:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rp_patch::testing::InMemoryStore;
    use rp_patch::{EffectError, StoreError, TransactionContext};
    use serde_json::{json, Value};

    fn noop(
        _: &mut dyn TransactionContext,
        _: &ConfigurationInstance,
    ) -> Result<(), EffectError> {
        Ok(())
    }

    fn registry(units: Vec<PatchUnit>) -> Arc<PatchRegistry> {
        Arc::new(PatchRegistry::load(units).unwrap())
    }

    /// Store whose transactions refuse to stage ledger records, and which
    /// remembers whether the runner rolled the transaction back.
    struct RecordFailStore {
        inner: InMemoryStore,
        rolled_back: Arc<AtomicBool>,
    }

    struct RecordFailCtx<'a> {
        inner: Box<dyn TransactionContext + 'a>,
        rolled_back: Arc<AtomicBool>,
    }

    impl TransactionContext for RecordFailCtx<'_> {
        fn read_entity(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.read_entity(key)
        }

        fn write_entity(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
            self.inner.write_entity(key, value)
        }

        fn delete_entity(&mut self, key: &str) -> Result<(), StoreError> {
            self.inner.delete_entity(key)
        }

        fn record_applied(&mut self, _record: AppliedRecord) -> Result<(), StoreError> {
            Err(StoreError::LedgerWrite("ledger unavailable".to_string()))
        }

        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit()
        }

        fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.rolled_back.store(true, Ordering::SeqCst);
            self.inner.rollback()
        }
    }

    impl ConfigStore for RecordFailStore {
        fn begin_context<'a>(
            &'a self,
            instance: &InstanceId,
        ) -> Result<Box<dyn TransactionContext + 'a>, StoreError> {
            Ok(Box::new(RecordFailCtx {
                inner: self.inner.begin_context(instance)?,
                rolled_back: Arc::clone(&self.rolled_back),
            }))
        }

        fn ledger(&self) -> &dyn AppliedLedger {
            self.inner.ledger()
        }
    }

    #[test]
    fn test_check_status_reports_pending_plan() {
        let runner = MigrationRunner::new(
            registry(vec![
                PatchUnit::new("a", "Version075", 1, noop).mandatory(),
                PatchUnit::new("b", "Version075", 2, noop).mandatory(),
            ]),
            InMemoryStore::new(),
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        let status = runner.check_status(&instance, &PatchSelection::none()).unwrap();
        assert_matches!(
            status,
            MigrationStatus::MigrationRequired { pending } if pending.len() == 2
        );
    }

    #[test]
    fn test_run_commits_effect_and_record_together() {
        let effect = |ctx: &mut dyn TransactionContext,
                      _: &ConfigurationInstance|
         -> Result<(), EffectError> {
            ctx.write_entity("drop_group.x", json!({ "entries": [] }))?;
            Ok(())
        };
        let store = InMemoryStore::new();
        let runner = MigrationRunner::new(
            registry(vec![PatchUnit::new("u075", "Version075", 1, effect).mandatory()]),
            store.clone(),
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        let report = runner.run_instance(&instance, &PatchSelection::none()).unwrap();
        assert_eq!(report.state, InstanceState::Applied);
        assert_eq!(report.applied, vec![PatchId::from("u075")]);
        assert!(store.snapshot(instance.id()).contains_key("drop_group.x"));
        assert!(store.ledger().is_applied(instance.id(), &PatchId::from("u075")).unwrap());
    }

    #[test]
    fn test_up_to_date_run_is_a_noop() {
        let store = InMemoryStore::new();
        let runner = MigrationRunner::new(
            registry(vec![PatchUnit::new("a", "Version075", 1, noop).mandatory()]),
            store,
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        runner.run_instance(&instance, &PatchSelection::none()).unwrap();
        let report = runner.run_instance(&instance, &PatchSelection::none()).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.state, InstanceState::Applied);
        assert_matches!(
            runner.check_status(&instance, &PatchSelection::none()).unwrap(),
            MigrationStatus::UpToDate
        );
    }

    #[test]
    fn test_abort_stops_before_next_unit() {
        let store = InMemoryStore::new();
        let runner = MigrationRunner::new(
            registry(vec![PatchUnit::new("a", "Version075", 1, noop).mandatory()]),
            store,
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        runner.abort();
        let err = runner.run_instance(&instance, &PatchSelection::none()).unwrap_err();
        assert_matches!(err, MigrationError::Aborted { at_index: 0, .. });
        assert!(runner.store().applied_records().is_empty());
    }

    #[test]
    fn test_record_staging_failure_rolls_back_the_effect() {
        let effect = |ctx: &mut dyn TransactionContext,
                      _: &ConfigurationInstance|
         -> Result<(), EffectError> {
            ctx.write_entity("drop_group.x", json!({ "entries": [] }))?;
            Ok(())
        };
        let inner = InMemoryStore::new();
        let rolled_back = Arc::new(AtomicBool::new(false));
        let store =
            RecordFailStore { inner: inner.clone(), rolled_back: Arc::clone(&rolled_back) };
        let runner = MigrationRunner::new(
            registry(vec![PatchUnit::new("u075", "Version075", 1, effect).mandatory()]),
            store,
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        let err = runner.run_instance(&instance, &PatchSelection::none()).unwrap_err();
        assert_matches!(err, MigrationError::CommitFailed { .. });
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(inner.snapshot(instance.id()).is_empty());
        assert!(inner.applied_records().is_empty());
    }

    #[test]
    fn test_failed_run_surfaces_failed_state_through_the_error() {
        let failing = |_: &mut dyn TransactionContext,
                       _: &ConfigurationInstance|
         -> Result<(), EffectError> {
            Err(EffectError::failed("drop entry missing"))
        };
        let runner = MigrationRunner::new(
            registry(vec![
                PatchUnit::new("a", "Version075", 1, noop).mandatory(),
                PatchUnit::new("b", "Version075", 2, failing).mandatory(),
            ]),
            InMemoryStore::new(),
        );
        let instance = ConfigurationInstance::new(InstanceId::new("world-1"), "Version075");

        let err = runner.run_instance(&instance, &PatchSelection::none()).unwrap_err();
        let state = match err {
            MigrationError::PatchApplyFailed { at_index, .. } => {
                InstanceState::Failed { at: at_index }
            }
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(state, InstanceState::Failed { at: 1 });
        assert_eq!(runner.store().applied_records().len(), 1);
    }

    #[test]
    fn test_runner_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MigrationRunner<InMemoryStore>>();
    }
}
