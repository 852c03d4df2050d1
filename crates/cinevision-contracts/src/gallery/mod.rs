pub mod snapshot;
pub mod store;

pub use snapshot::{export_snapshot, import_snapshot, parse_snapshot};
pub use store::ArtifactStore;
