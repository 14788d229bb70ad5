//! Module transformations run by the compile pipeline.
//!
//! - [`specialize`] - the specialization pass proper
//! - [`entry`] - entry-point metadata tagging
//! - [`link`] - linking tracked modules and compiled functions into the module under specialization

pub mod entry;
pub mod link;
pub mod specialize;

pub use entry::{find_entry, is_entry, mark_entry, unmark_entry, ENTRY_METADATA};
pub use link::link_fragment;
pub use specialize::Specializer;
