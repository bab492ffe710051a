//! Warden — sandboxed execution engine for a personal AI agent.
//!
//! Decides how each request may run (directly on the host or inside a managed
//! container), materialises that environment, hands the agent only the
//! secrets the session is entitled to, and streams back structured events.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod executor;
pub mod logging;
pub mod session;
pub mod trust;
