//! Debug logging module for development-time diagnostics
//!
//! This module provides conditional compilation macros that enable detailed logging
//! during development while ensuring zero runtime overhead in production builds.
//! All macros are controlled by the `dev-log` feature flag.
//!
//! # Usage
//!
//! Enable the feature in your Cargo.toml or via command line:
//! ```bash
//! cargo run --features "dev-log"
//! ```
//!
//! Then import and use the macros:
//! ```rust
//! use kairo_core::{debug_log, debug_error};
//!
//! debug_log!("Reactor started, {} readers registered", 3);
//! debug_error!("Descriptor callback failed: {}", "broken pipe");
//! ```

/// General-purpose debug logging macro
///
/// Outputs informational messages prefixed with `[DEBUG]`.
/// Use for general event-loop state and flow information.
///
/// # Examples
/// ```rust
/// use kairo_core::debug_log;
/// debug_log!("Connection accepted");
/// debug_log!("Dispatching {} expired timers", count);
/// ```
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        println!("[DEBUG] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Error logging macro for recoverable errors
///
/// Outputs to stderr with `[ERROR]` prefix.
/// Use for errors that don't terminate the reactor.
///
/// # Examples
/// ```rust
/// use kairo_core::debug_error;
/// debug_error!("Failed to parse box: {}", e);
/// debug_error!("Responder raised: {:?}", reason);
/// ```
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_error {
    ($($arg:tt)*) => {
        eprintln!("[ERROR] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_error {
    ($($arg:tt)*) => {};
}

/// Warning logging macro for potentially problematic conditions
///
/// Outputs to stderr with `[WARN]` prefix.
/// Use for deprecations, back-pressure events, or recoverable problems.
///
/// # Examples
/// ```rust
/// use kairo_core::debug_warn;
/// debug_warn!("Write buffer above high-water mark ({} bytes)", len);
/// debug_warn!("Throttling reads for {:.2}s", slack);
/// ```
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_warn {
    ($($arg:tt)*) => {
        eprintln!("[WARN] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_warn {
    ($($arg:tt)*) => {};
}

/// Detailed trace logging for verbose debugging
///
/// Outputs with `[TRACE]` prefix.
/// Use for detailed execution flow and state transitions.
///
/// # Examples
/// ```rust
/// use kairo_core::debug_trace;
/// debug_trace!("Connector {:?} -> Connecting", dest);
/// debug_trace!("Poll woke with {} events", n);
/// ```
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_trace {
    ($($arg:tt)*) => {
        println!("[TRACE] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_trace {
    ($($arg:tt)*) => {};
}
