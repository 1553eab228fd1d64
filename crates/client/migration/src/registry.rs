//! Compiled-in patch catalog.
//!
//! The registry is built once at startup from the statically defined catalog
//! and validated before any instance is touched: duplicate ids, dangling
//! `extends` references and extends-cycles are all fatal at load time.

use crate::MigrationError;
use rp_patch::{PatchId, PatchUnit};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct PatchRegistry {
    units: Vec<Arc<PatchUnit>>,
    by_id: HashMap<PatchId, Arc<PatchUnit>>,
}

impl PatchRegistry {
    /// Load and validate a catalog.
    pub fn load(units: impl IntoIterator<Item = PatchUnit>) -> Result<Self, MigrationError> {
        let units: Vec<Arc<PatchUnit>> = units.into_iter().map(Arc::new).collect();

        let mut by_id = HashMap::with_capacity(units.len());
        for unit in &units {
            if by_id.insert(unit.id().clone(), Arc::clone(unit)).is_some() {
                return Err(MigrationError::DuplicatePatchId { id: unit.id().clone() });
            }
        }

        // Validate the extends-graph: every base resolves, no cycles.
        // Out-degree is at most one, so a walk from each unit suffices.
        for unit in &units {
            let mut chain = vec![unit.id().clone()];
            let mut current = unit.base();
            while let Some(base_id) = current {
                if chain.contains(base_id) {
                    chain.push(base_id.clone());
                    return Err(MigrationError::CyclicExtends { chain });
                }
                let base = by_id.get(base_id).ok_or_else(|| MigrationError::MissingBase {
                    // `chain` is never empty: it starts with `unit`.
                    id: chain.last().cloned().unwrap_or_else(|| unit.id().clone()),
                    base: base_id.clone(),
                })?;
                chain.push(base_id.clone());
                current = base.base();
            }
        }

        tracing::debug!("patch registry loaded with {} unit(s)", units.len());
        Ok(Self { units, by_id })
    }

    /// Enumerate the catalog. Order is not significant.
    pub fn discover_patches(&self) -> impl Iterator<Item = &Arc<PatchUnit>> {
        self.units.iter()
    }

    pub fn unit(&self, id: &PatchId) -> Option<&Arc<PatchUnit>> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// True if `ancestor` appears anywhere in the extends-chain of `of`.
    pub(crate) fn is_ancestor(&self, ancestor: &PatchId, of: &PatchId) -> bool {
        let mut current = self.by_id.get(of).and_then(|u| u.base());
        while let Some(base_id) = current {
            if base_id == ancestor {
                return true;
            }
            current = self.by_id.get(base_id).and_then(|u| u.base());
        }
        false
    }
}
