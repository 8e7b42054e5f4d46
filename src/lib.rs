//! 遥测规则引擎
//!
//! 租户定义的规则是由过滤、转换、富化、动作和流程控制节点组成的有向无环图。
//! 入站事件经触发层匹配活动规则,通过防抖与限流后交给执行引擎按广度优先遍历。

pub mod aop;
pub mod collaborators;
pub mod components;
pub mod config;
pub mod engine;
pub mod script;
pub mod trigger;
pub mod types;
pub mod utils;

pub use components::{builtin_registry, register_builtin_nodes};
pub use config::EngineConfig;
pub use engine::{ExecutionReport, NodeRegistry, RuleEngine, RuleGraph};
pub use trigger::{InboundEvent, TriggerConsumer, TriggerOutcome};
pub use types::*;
