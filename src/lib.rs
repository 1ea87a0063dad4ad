//! Routewise - policy routing for a circumvention proxy suite.
//!
//! Classifies destinations as DIRECT, TUNNEL or BLOCKED, answers DNS
//! consistently with that decision and opens connections with failover
//! between the direct path and tunnel backends.

pub mod backend;
pub mod cache;
pub mod config;
pub mod connect;
pub mod context;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod logging;
pub mod policy;
pub mod proxy;
pub mod resolver;
pub mod responder;
pub mod server;
pub mod stats;
