//! Background re-admission of failed nodes

mod prober;

pub use prober::{probe_node, HealthProber, ProbeError, ProbeRound, ANTHROPIC_VERSION};
