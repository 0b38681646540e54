//! # cask-network
//!
//! The routed network driver: grafts a container into the host routing
//! table via a veth pair, without NAT. One end stays on the host with a
//! /32-style route pointing at it; the other is renamed and configured
//! inside the container's network namespace. An optional iptables chain
//! filters ingress traffic per interface.

#![warn(missing_docs)]

pub mod link;
pub mod netfilter;
pub mod routed;

pub use link::LinkOp;
pub use netfilter::NetFilter;
pub use routed::{NetworkEndpoint, RoutedDriver};
