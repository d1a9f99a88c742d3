pub mod config;
pub mod coordinator;
mod driver;
pub mod liveness;
pub mod lobby;
pub mod memory_store;
pub mod model;
pub mod projection;
pub mod protocol;
pub mod questions;
pub mod session;
pub mod store;
pub mod view;

#[cfg(test)]
mod testing;

pub use config::{RetryPolicy, SessionConfig};
pub use memory_store::MemoryStore;
pub use session::{Session, SessionError, SessionEvent, SessionSnapshot};
pub use store::{Change, SharedStore, Store, StoreError, StoreResult, Subscription};
