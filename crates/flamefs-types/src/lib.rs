#[allow(non_snake_case)]
pub mod status_code;

pub mod result;
pub mod status;

#[macro_use]
pub mod strong_type;

pub mod address;
pub mod ids;
pub mod time;
pub mod uuid;

// Re-export commonly used items at the crate root.
pub use address::{Address, AddressType};
pub use ids::*;
pub use result::{make_error, make_error_msg, Result, Void};
pub use status::Status;
pub use status_code::*;
pub use time::{Duration, UtcTime};
pub use uuid::Uuid;
