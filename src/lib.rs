//! Khala shared-memory transport library.
//!
//! This library moves messages between a VM guest and its host through a
//! memory-mapped region, with a stream socket carrying the length frames
//! that mark message boundaries:
//!
//! - `transport` - Shared region, control channel, framing, and the
//!   single-message and chunked channels built on them
//! - `config` - Transport configuration (file, defaults, environment)
//! - `session` - Host and guest request/response loops
//!
//! # Example
//!
//! ```ignore
//! use khala::config::{Role, TransportConfig};
//! use khala::session::run_guest;
//!
//! let config = TransportConfig::load(Role::Guest)?;
//! let replies = run_guest(&config).await?;
//! ```

pub mod config;
pub mod session;
pub mod transport;
