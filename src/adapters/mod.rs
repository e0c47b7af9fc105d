//! Adapters: relays and the admin API on the inbound side, backend clients,
//! probes and stores on the outbound side.

pub mod inbound;
pub mod outbound;
