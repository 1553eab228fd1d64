use crate::store::{StoreError, TransactionContext};
use crate::{BaselineKey, ConfigurationInstance, PatchId};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Failure of a unit's effect. The transaction it ran in is rolled back.
#[derive(thiserror::Error, Debug)]
pub enum EffectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

impl EffectError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The data transformation a patch unit performs.
///
/// Effects must be idempotent and deterministic: the engine guarantees
/// exactly-once *commit* through the ledger, but an effect may be re-run
/// after a rollback. Any `Fn(&mut dyn TransactionContext,
/// &ConfigurationInstance) -> Result<(), EffectError>` is an effect.
pub trait PatchEffect: Send + Sync {
    fn apply(
        &self,
        ctx: &mut dyn TransactionContext,
        instance: &ConfigurationInstance,
    ) -> Result<(), EffectError>;
}

impl<F> PatchEffect for F
where
    F: Fn(&mut dyn TransactionContext, &ConfigurationInstance) -> Result<(), EffectError>
        + Send
        + Sync,
{
    fn apply(
        &self,
        ctx: &mut dyn TransactionContext,
        instance: &ConfigurationInstance,
    ) -> Result<(), EffectError> {
        self(ctx, instance)
    }
}

/// An atomic migration step, defined once and immutable for the lifetime of
/// the deployed catalog.
///
/// Identity and metadata are self-describing so an operator-facing surface
/// can list the catalog without running anything. `extends` declares explicit
/// composition: at most one base unit whose effect must be committed before
/// this unit's delta (the scheduler enforces this; the effect itself is only
/// the delta on top of the base).
#[derive(Clone)]
pub struct PatchUnit {
    id: PatchId,
    display_name: String,
    description: String,
    baseline: BaselineKey,
    version: u32,
    mandatory: bool,
    created_at: DateTime<Utc>,
    extends: Option<PatchId>,
    effect: Arc<dyn PatchEffect>,
}

impl PatchUnit {
    /// New non-mandatory unit with `created_at = now` and no base.
    pub fn new(
        id: impl Into<PatchId>,
        baseline: impl Into<BaselineKey>,
        version: u32,
        effect: impl PatchEffect + 'static,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.as_str().to_string(),
            description: String::new(),
            id,
            baseline: baseline.into(),
            version,
            mandatory: false,
            created_at: Utc::now(),
            extends: None,
            effect: Arc::new(effect),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark the unit as always applied when applicable (no operator opt-in).
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Declare the base unit this one extends.
    pub fn extends(mut self, base: impl Into<PatchId>) -> Self {
        self.extends = Some(base.into());
        self
    }

    pub fn id(&self) -> &PatchId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn baseline(&self) -> &BaselineKey {
        &self.baseline
    }

    /// Per-baseline version ordinal; resolution orders by this, ascending.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn base(&self) -> Option<&PatchId> {
        self.extends.as_ref()
    }

    pub fn apply(
        &self,
        ctx: &mut dyn TransactionContext,
        instance: &ConfigurationInstance,
    ) -> Result<(), EffectError> {
        self.effect.apply(ctx, instance)
    }
}

impl std::fmt::Debug for PatchUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchUnit")
            .field("id", &self.id)
            .field("baseline", &self.baseline)
            .field("version", &self.version)
            .field("mandatory", &self.mandatory)
            .field("extends", &self.extends)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
        _: &mut dyn TransactionContext,
        _: &ConfigurationInstance,
    ) -> Result<(), EffectError> {
        Ok(())
    }

    #[test]
    fn test_unit_defaults() {
        let unit = PatchUnit::new("u075", "Version075", 1, noop);
        assert_eq!(unit.id().as_str(), "u075");
        assert_eq!(unit.display_name(), "u075");
        assert!(!unit.is_mandatory());
        assert!(unit.base().is_none());
    }

    #[test]
    fn test_unit_builders() {
        let unit = PatchUnit::new("u095d", "Version095d", 1, noop)
            .with_display_name("0.95d drop table entries")
            .with_description("Adds entry Y to drop group X")
            .mandatory()
            .extends("u075");
        assert_eq!(unit.display_name(), "0.95d drop table entries");
        assert!(unit.is_mandatory());
        assert_eq!(unit.base().unwrap().as_str(), "u075");
    }
}
