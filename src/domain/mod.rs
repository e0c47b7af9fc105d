//! Domain Layer
//!
//! Hosts, assignments, events and the ports the rest of the balancer
//! plugs into. Nothing here performs I/O.

pub mod arrival_rate;
pub mod entities;
pub mod events;
pub mod ports;
pub mod services;
pub mod value_objects;
