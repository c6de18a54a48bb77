//! Watchpoint utilities.

#[cfg(feature = "interceptor")]
pub mod interceptor;

#[cfg(feature = "wpm")]
pub mod wpm;
