// Type aliases (must be declared before other modules that use it)
pub mod alias;

pub mod address;
pub mod debug;
pub mod defer;
pub mod error;
pub mod failure;
pub mod framed;
pub mod policy;
pub mod protocol;
pub mod reactor;
pub mod resolver;
pub mod transport;

// Re-export commonly used type aliases
pub use alias::{PMutex, PMutexGuard, PRwLock, PRwLockReadGuard, PRwLockWriteGuard};

pub use error::{ErrorKind, KairoError, Result};
pub use failure::FailureValue;
