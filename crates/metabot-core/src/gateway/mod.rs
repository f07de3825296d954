//! Inbound platform adapters.
//!
//! Adapters normalize platform updates into [`crate::bridge::IncomingMessage`]
//! and hand them to the bridge. Outbound traffic goes through
//! [`crate::sender`] instead.

#[cfg(feature = "telegram")]
pub mod telegram;
