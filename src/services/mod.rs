//! Background services

pub mod interface_monitor;
pub mod interfaces;

pub use interface_monitor::{InterfaceMonitor, InterfaceMonitorConfig, InterfaceMonitorHandle};
pub use interfaces::{egress_address, list_interfaces, local_edge_address, InterfaceAddr};
