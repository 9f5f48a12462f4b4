// ============================================================================
// cfgsync — per-machine settings synchronization engine
// ============================================================================

pub mod config;
pub mod core;
pub mod handle;
pub mod legacy;
pub mod product;
pub mod remote;
pub mod store;
pub mod stream;
pub mod sync;
pub mod valuestore;

// Re-export the main types for convenience.
pub use config::SettingsEngineConfig;
pub use core::{BlobRef, Clock, DataType, EndpointGuid, ProductKey, Result, SettingsError, SystemClock, Timestamp, Value, ValueRecord};
pub use handle::DatabaseHandle;
pub use legacy::{
    InMemoryFilesystemSource, InMemoryRegistrySource, LegacyFilesystemSource, LegacyManifest,
    LegacyRegistrySource, ManifestEntry, ManifestSource,
};
pub use product::{AdminRegistry, AppId, ProductRegistry, ProductRow};
pub use remote::{BackgroundWorker, RemoteRegistry, RemoteRow, SyncOutcome, WorkerEvent};
pub use sync::{ConflictProduct, ConflictValue, Resolve};
pub use valuestore::{CurrentRow, ValueStore};
