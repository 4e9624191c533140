//! Data plane components
//!
//! Flow classification, the mapping engine, per-protocol flow tables and
//! the top-level rewriter element.

mod flow;
mod flow_table;
mod mapping;
mod pattern;
mod rewriter;

pub use flow::FlowId;
pub use flow_table::FlowTable;
pub use mapping::{Mapping, MappingArena, MappingIdx};
pub use pattern::{Pattern, PatternSpec, PortRange};
pub use rewriter::{
    InputSpec, Mapper, PushAction, Rewriter, RewriterState, DEFAULT_GC_INTERVAL,
};
