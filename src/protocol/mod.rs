//! Network protocol support
//!
//! IPv4/TCP/UDP header views and checksum arithmetic. Only what the
//! rewrite path needs: zero-copy read views for classification, mutable
//! views for in-place header rewrites, and one's-complement helpers.

pub mod checksum;
pub mod ipv4;
pub mod tcp;
pub mod udp;
