//! Version resolution: which units apply to an instance, and in what
//! version order.

use crate::{MigrationError, PatchRegistry};
use itertools::Itertools;
use rp_patch::{BaselineKey, PatchId, PatchUnit};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Operator opt-in set for non-mandatory units.
///
/// Mandatory units ignore the selection entirely; a non-mandatory unit is
/// resolved only if its id is present here.
#[derive(Debug, Clone, Default)]
pub struct PatchSelection(BTreeSet<PatchId>);

impl PatchSelection {
    /// Mandatory units only.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn opt_in(ids: impl IntoIterator<Item = impl Into<PatchId>>) -> Self {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, id: impl Into<PatchId>) {
        self.0.insert(id.into());
    }

    pub fn contains(&self, id: &PatchId) -> bool {
        self.0.contains(id)
    }
}

/// Filter the catalog down to units applicable to `baseline` and not yet in
/// the ledger, ordered by version ordinal ascending.
///
/// Two units sharing a version ordinal are legal only when one is an
/// extends-ancestor of the other (the ancestor sorts first); any other tie is
/// an [`MigrationError::AmbiguousOrder`] and fails the resolve pass rather
/// than guessing.
pub fn resolve_applicable(
    registry: &PatchRegistry,
    baseline: &BaselineKey,
    applied: &BTreeSet<PatchId>,
    selection: &PatchSelection,
) -> Result<Vec<Arc<PatchUnit>>, MigrationError> {
    let mut units: Vec<Arc<PatchUnit>> = registry
        .discover_patches()
        .filter(|u| u.baseline() == baseline)
        .filter(|u| !applied.contains(u.id()))
        .filter(|u| u.is_mandatory() || selection.contains(u.id()))
        .cloned()
        .collect();
    units.sort_by_key(|u| u.version());

    let mut ordered = Vec::with_capacity(units.len());
    for (version, group) in &units.into_iter().chunk_by(|u| u.version()) {
        let mut group: Vec<Arc<PatchUnit>> = group.collect();
        if group.len() > 1 {
            order_tied_group(registry, baseline, version, &mut group)?;
        }
        ordered.extend(group);
    }
    Ok(ordered)
}

/// Order a same-version group by declared precedence: every pair must be
/// related through the extends-chain, ancestors first.
fn order_tied_group(
    registry: &PatchRegistry,
    baseline: &BaselineKey,
    version: u32,
    group: &mut [Arc<PatchUnit>],
) -> Result<(), MigrationError> {
    for i in 0..group.len() {
        for j in (i + 1)..group.len() {
            let (a, b) = (&group[i], &group[j]);
            if !registry.is_ancestor(a.id(), b.id()) && !registry.is_ancestor(b.id(), a.id()) {
                return Err(MigrationError::AmbiguousOrder {
                    baseline: baseline.clone(),
                    version,
                    first: a.id().clone(),
                    second: b.id().clone(),
                });
            }
        }
    }
    // Pairwise related with out-degree one means the group is a chain, so
    // ancestor counts within the group are distinct.
    let depths: HashMap<PatchId, usize> = group
        .iter()
        .map(|u| {
            let depth = group.iter().filter(|o| registry.is_ancestor(o.id(), u.id())).count();
            (u.id().clone(), depth)
        })
        .collect();
    group.sort_by_key(|u| depths.get(u.id()).copied().unwrap_or(0));
    Ok(())
}
