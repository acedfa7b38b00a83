pub mod cache;
pub mod comparator;
pub mod engine;
pub mod file_state;
pub mod probe;
pub mod reconciler;
pub mod report;
pub mod scanner;
pub mod transfer;

pub use cache::{
    CacheDelta, CacheSnapshot, FingerprintCache, FingerprintStore, JsonStore, SourceDelta, SourceEntries,
};
pub use comparator::{ChangeStatus, CompareConfig, FileComparator};
pub use engine::{EngineConfig, EngineError, SyncEngine};
pub use file_state::{hash_file, path_key, Blake3Hasher, ContentHasher, Fingerprint, LiveMeta};
pub use probe::{NetworkProber, Prober};
pub use reconciler::{SourceReconciler, SourceSync};
pub use report::{Change, RunResult, SourceOutcome, SourceReport, SyncStats};
pub use scanner::{FileScanner, ScanOutcome, ScannedFile};
pub use transfer::{copy_preserving_mtime, copy_to_all, CopyOutcome};
