pub mod clock;
pub mod error;
pub mod types;
pub mod value;

pub use clock::{Clock, SystemClock};
pub use error::{Result, SettingsError};
pub use types::{EndpointGuid, ProductKey, Timestamp};
pub use value::{BlobRef, DataType, Value, ValueRecord};
