//! 元数据测试引擎
//!
//! 对元数据目录中的实体评估用户定义的测试：
//! - JSON 测试定义的解析与校验
//! - 属性路径的批量解析（实体标识、版本化切面、系统元数据）
//! - 带刷新任务的定义缓存
//! - 结果写入与基于结论的动作执行
//! - 全量回填与命令行工具

pub mod actions;
pub mod backfill;
pub mod cache;
pub mod cli;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod memory;
pub mod models;
pub mod operators;
pub mod parser;
pub mod predicate;
pub mod query;
pub mod traits;
pub mod urn;

pub use actions::{ActionArguments, ActionHandler, ActionRegistry};
pub use backfill::{BackfillJob, BackfillReport};
pub use cache::{CacheSnapshot, DefinitionCache};
pub use engine::{EngineCollaborators, EvaluationMode, TestEngine};
pub use error::{Result, TestEngineError};
pub use evaluator::OperatorEvaluator;
pub use memory::InMemoryMetadataStore;
pub use models::{
    ActionKind, Predicate, PropertyRef, TestDefinition, TestResults, ValidationResult, Verdict,
};
pub use operators::Operator;
pub use parser::TestDefinitionParser;
pub use predicate::{PredicateEvaluator, ResolvedValues};
pub use query::{EntityRegistry, QueryEngine};
pub use traits::{ActionApplier, DefinitionSource, EntitySearch, EntityStore, ResultSink};
pub use urn::Urn;
