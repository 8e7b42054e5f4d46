mod accounting;
mod catalog;
mod graph;
mod node;
mod rule;

pub use accounting::ExecutionAccounting;
pub use catalog::RuleCatalog;
pub use graph::{RuleGraph, DEFAULT_PORT};
pub use node::*;
pub use rule::{ExecutionReport, RuleEngine};
