//! 查询引擎
//!
//! 按属性路径批量解析实体的值。解析工作委托给一组有序的路径求值器：
//! 标识 -> 版本化切面 -> 系统元数据，每个属性路径交给第一个声明可处理的求值器。
//!
//! 同一实体类型的请求会合并后一次性交给求值器，从而使后端调用次数只与
//! 涉及的 (实体类型, 切面) 组合数相关，而与实体数、路径数无关。
//! 实体、切面或跳转中间值缺失时不产生条目，不视为错误。

mod aspect;
mod identity;
pub mod registry;
mod system;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::models::{PropertyRef, ValidationResult};
use crate::predicate::ResolvedValues;
use crate::traits::EntityStore;
use crate::urn::Urn;

pub use aspect::AspectPathEvaluator;
pub use identity::IdentityPathEvaluator;
pub use registry::{AspectSpec, EntityRegistry, EntitySpec};
pub use system::SystemMetadataPathEvaluator;

/// 批量解析结果：实体 -> 属性 -> 值集合
pub type BatchResolution = HashMap<Urn, ResolvedValues>;

/// 路径求值策略
#[async_trait]
pub trait PathEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// 是否能够解析该实体类型上的属性路径
    fn is_eligible(&self, entity_type: &str, reference: &PropertyRef) -> bool;

    /// 静态校验属性路径
    fn validate(&self, engine: &QueryEngine, entity_type: &str, reference: &PropertyRef) -> ValidationResult;

    /// 解析结果是否来自存储；为 false 时不存在的实体也会得到值
    fn reads_store(&self) -> bool {
        true
    }

    /// 批量解析同一实体类型的一组实体与路径
    async fn resolve(
        &self,
        engine: &QueryEngine,
        entity_type: &str,
        urns: &BTreeSet<Urn>,
        references: &BTreeSet<PropertyRef>,
    ) -> Result<BatchResolution>;
}

/// 单个实体类型的解析请求
#[derive(Debug, Clone, Default)]
pub(crate) struct TypeRequest {
    pub urns: BTreeSet<Urn>,
    pub references: BTreeSet<PropertyRef>,
}

/// 查询引擎
pub struct QueryEngine {
    evaluators: Vec<Arc<dyn PathEvaluator>>,
}

impl QueryEngine {
    /// 按给定顺序使用求值器
    pub fn new(evaluators: Vec<Arc<dyn PathEvaluator>>) -> Self {
        Self { evaluators }
    }

    /// 标准求值器组合：标识 -> 切面 -> 系统元数据
    pub fn standard(store: Arc<dyn EntityStore>, registry: Arc<EntityRegistry>) -> Self {
        Self::new(vec![
            Arc::new(IdentityPathEvaluator),
            Arc::new(AspectPathEvaluator::new(store.clone(), registry.clone())),
            Arc::new(SystemMetadataPathEvaluator::new(store, registry)),
        ])
    }

    /// 批量解析一组实体上的一组属性路径
    #[instrument(skip(self, urns, references), fields(urns = urns.len(), references = references.len()))]
    pub async fn batch_resolve(
        &self,
        urns: &BTreeSet<Urn>,
        references: &BTreeSet<PropertyRef>,
    ) -> Result<BatchResolution> {
        if urns.is_empty() || references.is_empty() {
            return Ok(BatchResolution::new());
        }

        let mut requests: BTreeMap<String, TypeRequest> = BTreeMap::new();
        for urn in urns {
            let request = requests.entry(urn.entity_type().to_string()).or_default();
            request.urns.insert(urn.clone());
            request.references.extend(references.iter().cloned());
        }
        self.resolve_requests(requests).await
    }

    /// 该路径是否由不访问存储的求值器解析
    pub(crate) fn resolves_without_store(&self, entity_type: &str, reference: &PropertyRef) -> bool {
        self.evaluator_index(entity_type, reference)
            .is_some_and(|index| !self.evaluators[index].reads_store())
    }

    /// 按实体类型分组执行解析
    pub(crate) async fn resolve_requests(
        &self,
        requests: BTreeMap<String, TypeRequest>,
    ) -> Result<BatchResolution> {
        let mut resolution = BatchResolution::new();

        for (entity_type, request) in requests {
            if request.urns.is_empty() || request.references.is_empty() {
                continue;
            }

            let mut assigned: Vec<BTreeSet<PropertyRef>> = vec![BTreeSet::new(); self.evaluators.len()];
            for reference in &request.references {
                match self.evaluator_index(&entity_type, reference) {
                    Some(index) => {
                        assigned[index].insert(reference.clone());
                    }
                    None => {
                        warn!(entity_type = %entity_type, reference = %reference, "没有求值器能够解析该属性路径");
                    }
                }
            }

            for (evaluator, references) in self.evaluators.iter().zip(assigned) {
                if references.is_empty() {
                    continue;
                }
                debug!(
                    evaluator = evaluator.name(),
                    entity_type = %entity_type,
                    urns = request.urns.len(),
                    references = references.len(),
                    "解析属性路径"
                );
                let partial = evaluator
                    .resolve(self, &entity_type, &request.urns, &references)
                    .await?;
                merge_into(&mut resolution, partial);
            }
        }

        Ok(resolution)
    }

    /// 校验属性路径能否在每种实体类型上解析，每个问题一条消息
    pub fn validate_reference(
        &self,
        reference: &PropertyRef,
        entity_types: &BTreeSet<String>,
    ) -> ValidationResult {
        if reference.segments().any(str::is_empty) {
            return ValidationResult::invalid(format!("属性路径 '{}' 含有空段", reference));
        }

        entity_types
            .iter()
            .map(|entity_type| match self.evaluator_index(entity_type, reference) {
                Some(index) => self.evaluators[index].validate(self, entity_type, reference),
                None => ValidationResult::invalid(format!(
                    "实体类型 '{}' 无法解析属性路径 '{}'",
                    entity_type, reference
                )),
            })
            .fold(ValidationResult::valid(), ValidationResult::merge)
    }

    fn evaluator_index(&self, entity_type: &str, reference: &PropertyRef) -> Option<usize> {
        self.evaluators
            .iter()
            .position(|evaluator| evaluator.is_eligible(entity_type, reference))
    }
}

/// 合并部分结果，空值集合不产生条目
fn merge_into(resolution: &mut BatchResolution, partial: BatchResolution) {
    for (urn, values) in partial {
        for (reference, list) in values {
            if list.is_empty() {
                continue;
            }
            resolution
                .entry(urn.clone())
                .or_default()
                .entry(reference)
                .or_default()
                .extend(list);
        }
    }
}
