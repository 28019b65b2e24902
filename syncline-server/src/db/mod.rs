//! Database concerns: schema bootstrap and liveness probes.

pub mod bootstrap;
