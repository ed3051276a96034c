//! Durable session persistence.

pub mod file;
pub mod null;
pub mod traits;

pub use file::FileSessionStore;
pub use null::NullStore;
pub use traits::{PersistedSession, SessionStore};
