//! Orchestration core of the Forge software factory.
//!
//! A task is submitted against a graph template (Graphviz DOT), and the
//! workflow engine drives it through role executors, the tool gateway, the
//! refinement controller, and the human-in-the-loop gate until it succeeds,
//! fails with a typed reason, or is aborted.

pub mod artifacts;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod graph;
pub mod hitl;
pub mod lint;
pub mod outcome;
pub mod parse;
pub mod refinement;
pub mod roles;
pub mod run;
pub mod stage;
pub mod storage;
pub mod templates;

pub use artifacts::*;
pub use config::*;
pub use diagnostics::*;
pub use engine::*;
pub use errors::*;
pub use events::*;
pub use gateway::*;
pub use graph::*;
pub use hitl::*;
pub use lint::*;
pub use outcome::*;
pub use parse::*;
pub use refinement::*;
pub use roles::*;
pub use run::*;
pub use stage::*;
pub use storage::*;
pub use templates::*;
