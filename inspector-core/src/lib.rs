pub mod config;
pub mod db;
pub mod error;
pub mod handle;
pub mod ironic;
pub mod models;
pub mod retry;
pub mod store;

pub use config::InspectorConfig;
pub use error::InspectorError;
pub use handle::SessionHandle;
pub use ironic::{ControlPlane, IronicClient, IronicError};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use store::SessionStore;
