//! vizgate: control plane for interactive visualization sessions.
//!
//! Two services share this library and a durable job registry:
//!
//! - the **scheduler** ([`scheduler`]) authenticates users, allocates compute
//!   jobs through a pluggable [`allocator`], and reaps expired sessions;
//! - the **proxy** ([`proxy`]) upgrades client connections to websockets and
//!   relays frames to the backend recorded for the job.
//!
//! The services never talk to each other directly; all coordination goes
//! through the [`registry`].

pub mod allocator;
pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod server;
