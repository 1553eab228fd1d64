use rp_patch::{BaselineKey, InstanceId, PatchId, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("duplicate patch id '{id}' in catalog")]
    DuplicatePatchId { id: PatchId },

    #[error("patch '{id}' extends unknown patch '{base}'")]
    MissingBase { id: PatchId, base: PatchId },

    #[error("extends-cycle in patch catalog: {}", display_chain(.chain))]
    CyclicExtends { chain: Vec<PatchId> },

    #[error(
        "ambiguous order for baseline '{baseline}' version {version}: \
         '{first}' and '{second}' declare no precedence"
    )]
    AmbiguousOrder { baseline: BaselineKey, version: u32, first: PatchId, second: PatchId },

    #[error("patch '{patch}' failed on instance '{instance}' (unit {at_index}): {message}")]
    PatchApplyFailed { patch: PatchId, instance: InstanceId, at_index: usize, message: String },

    #[error("commit failed for patch '{patch}' on instance '{instance}': {source}")]
    CommitFailed {
        patch: PatchId,
        instance: InstanceId,
        #[source]
        source: StoreError,
    },

    #[error("migration aborted on instance '{instance}' before unit {at_index}")]
    Aborted { instance: InstanceId, at_index: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn display_chain(chain: &[PatchId]) -> String {
    chain.iter().map(PatchId::as_str).collect::<Vec<_>>().join(" -> ")
}
