//! pathpin - Network-path-pinned forwarding proxy
//!
//! Accepts HTTP proxy clients on one network and relays their traffic over a
//! different, explicitly selected egress path instead of the default route.
//!
//! ## Features
//!
//! - CONNECT tunnels and plain absolute-URI forwarding
//! - Egress sockets pinned to an interface and/or source address
//! - Sessions cut off as soon as the egress path is lost, never rerouted
//! - Interface monitor that republishes the path when the network returns

pub mod config;
pub mod error;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{ProxyError, Result};
