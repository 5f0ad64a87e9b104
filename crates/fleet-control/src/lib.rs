//! Control plane of a crawl fleet: node sessions, per-host admission,
//! adaptive per-store concurrency and request dispatch.

pub mod broker;
pub mod cache;
pub mod config;
pub mod crawler;
pub mod dispatch;
mod error;
pub mod host_lock;
pub mod memory;
pub mod node;
pub mod ns;
mod plane;
pub mod repo;
pub mod store;

pub use error::{Error, Result};
pub use plane::ControlPlane;
