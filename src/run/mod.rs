//! Run state: the data model and its durable store.

pub mod model;
pub mod store;

pub use model::{
    ArtifactKind, Artifacts, Classification, LeaseRef, PhaseDetail, PhaseOutcomeKind, PhaseRecord,
    Run, RunStatus,
};
pub use store::RunStore;
