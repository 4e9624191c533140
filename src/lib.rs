//! Flownat - Stateful IP Flow Rewriter
//!
//! A connection-tracked NAPT element for TCP/UDP over IPv4. Packets are
//! classified by 5-tuple, rewritten in place per the input port's policy,
//! and emitted on a policy-chosen output port; return traffic is
//! translated symmetrically through a paired reverse mapping.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
