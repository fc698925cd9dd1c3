//! hierhist: two-helper hierarchical histograms over secret-shared reports
//!
//! - [`dpf`]: incremental distributed point function share engine
//! - [`core`]: query steps, expansion plans, partial results, storage layout
//! - [`helper`]: level orchestrator, dependency gate, request channel

pub use hierhist_core as core;
pub use hierhist_dpf as dpf;
pub use hierhist_helper as helper;
