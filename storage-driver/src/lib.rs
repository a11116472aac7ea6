mod driver;
mod error;
mod lock;
mod transfer;

pub use driver::Driver;
pub use driver::{has_reserved_component, is_reserved_name};
pub use driver::Metadata;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use lock::{LockRetry, LockToken, ResourceLock};
pub use transfer::{Download, Source, TransferState, Upload, UploadSink};
