//! Extends-chain scheduling.
//!
//! `extends` is explicit composition: a unit declares at most one base whose
//! effect must be committed before the unit's own delta. Scheduling is a
//! topological sort over that forest, restricted to the resolve pass at
//! hand: a unit runs only after its base has been scheduled in this pass or
//! is already recorded in the ledger. Bases outside the applicable subset
//! (another baseline, or not opted in) are pulled in transitively, which is
//! what lets a season catalog reuse a historical baseline's unit.
//!
//! Cycles cannot reach this module; they are rejected when the registry
//! loads.

use crate::{MigrationError, PatchRegistry};
use rp_patch::{PatchId, PatchUnit};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Order `applicable` (already version-sorted by the resolver) so every
/// unit's extends-ancestors precede it, pulling in unapplied ancestors that
/// the resolver's baseline filter left out.
pub fn schedule(
    registry: &PatchRegistry,
    applicable: &[Arc<PatchUnit>],
    applied: &BTreeSet<PatchId>,
) -> Result<Vec<Arc<PatchUnit>>, MigrationError> {
    let mut scheduled: BTreeSet<PatchId> = BTreeSet::new();
    let mut out: Vec<Arc<PatchUnit>> = Vec::with_capacity(applicable.len());

    for unit in applicable {
        if scheduled.contains(unit.id()) {
            // Already pulled in as somebody's base earlier in this pass.
            continue;
        }

        // Walk up the extends-chain collecting bases that still need to run.
        let mut pending: Vec<Arc<PatchUnit>> = Vec::new();
        let mut current = unit.base();
        while let Some(base_id) = current {
            if applied.contains(base_id) || scheduled.contains(base_id) {
                break;
            }
            let base = registry.unit(base_id).ok_or_else(|| MigrationError::MissingBase {
                id: pending.last().map(|u| u.id()).unwrap_or(unit.id()).clone(),
                base: base_id.clone(),
            })?;
            pending.push(Arc::clone(base));
            current = base.base();
        }

        // Root-most base first, then down the chain to the unit itself.
        for base in pending.into_iter().rev() {
            scheduled.insert(base.id().clone());
            out.push(base);
        }
        scheduled.insert(unit.id().clone());
        out.push(Arc::clone(unit));
    }

    Ok(out)
}
