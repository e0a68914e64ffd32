//! 版本化切面路径求值器
//!
//! 路径首段为切面名，其余段逐级进入切面 JSON。遇到注册表声明的引用字段且后面还有路径时，
//! 剩余部分在被引用实体上继续解析：所有源实体的跳转目标汇总后只发起一次递归批量解析。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use catalog_shared::observability::metrics;
use serde_json::Value;
use tracing::{debug, trace};

use super::registry::EntityRegistry;
use super::{BatchResolution, PathEvaluator, QueryEngine, TypeRequest};
use crate::error::Result;
use crate::models::{PropertyRef, ValidationResult};
use crate::traits::EntityStore;
use crate::urn::Urn;

/// 路径解析计划
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPlan {
    /// 在切面内取值
    Local { aspect: String, fields: Vec<String> },
    /// 取出引用 URN 后在目标实体上解析 `remaining`
    Hop {
        aspect: String,
        fields: Vec<String>,
        targets: Vec<String>,
        remaining: PropertyRef,
    },
}

impl PathPlan {
    fn aspect(&self) -> &str {
        match self {
            PathPlan::Local { aspect, .. } | PathPlan::Hop { aspect, .. } => aspect,
        }
    }

    fn fields(&self) -> &[String] {
        match self {
            PathPlan::Local { fields, .. } | PathPlan::Hop { fields, .. } => fields,
        }
    }
}

/// 一个待完成的跳转
struct PendingHop<'p> {
    source: Urn,
    reference: &'p PropertyRef,
    remaining: &'p PropertyRef,
    targets: Vec<Urn>,
}

pub struct AspectPathEvaluator {
    store: Arc<dyn EntityStore>,
    registry: Arc<EntityRegistry>,
}

impl AspectPathEvaluator {
    pub fn new(store: Arc<dyn EntityStore>, registry: Arc<EntityRegistry>) -> Self {
        Self { store, registry }
    }

    fn plan(&self, entity_type: &str, reference: &PropertyRef) -> Option<PathPlan> {
        let mut segments = reference.segments();
        let aspect = segments.next()?;
        let spec = self.registry.aspect(entity_type, aspect)?;
        let fields: Vec<String> = segments.map(str::to_string).collect();

        for split in 1..fields.len() {
            let field_path = fields[..split].join(".");
            if let Some(targets) = spec.reference_targets(&field_path) {
                return Some(PathPlan::Hop {
                    aspect: aspect.to_string(),
                    fields: fields[..split].to_vec(),
                    targets: targets.to_vec(),
                    remaining: PropertyRef::new(fields[split..].join(".")),
                });
            }
        }

        Some(PathPlan::Local {
            aspect: aspect.to_string(),
            fields,
        })
    }
}

impl AspectPathEvaluator {
    /// 剩余路径不经过存储时，先确认跳转目标存在，移除并返回不存在的目标
    async fn missing_targets(
        &self,
        engine: &QueryEngine,
        requests: &mut BTreeMap<String, TypeRequest>,
    ) -> Result<BTreeSet<Urn>> {
        let mut missing = BTreeSet::new();
        for (entity_type, request) in requests.iter_mut() {
            let storeless = request
                .references
                .iter()
                .any(|reference| engine.resolves_without_store(entity_type, reference));
            if !storeless {
                continue;
            }

            let aspects: BTreeSet<String> = self
                .registry
                .key_aspect(entity_type)
                .map(str::to_string)
                .into_iter()
                .collect();
            metrics::record_aspect_fetch(entity_type, self.name());
            let existing = self.store.fetch_aspects(entity_type, &request.urns, &aspects).await?;
            request.urns.retain(|target| {
                let found = existing.contains_key(target);
                if !found {
                    debug!(urn = %target, "跳转目标实体不存在，跳过");
                    missing.insert(target.clone());
                }
                found
            });
        }
        Ok(missing)
    }
}

#[async_trait]
impl PathEvaluator for AspectPathEvaluator {
    fn name(&self) -> &'static str {
        "aspect"
    }

    fn is_eligible(&self, entity_type: &str, reference: &PropertyRef) -> bool {
        reference
            .segments()
            .next()
            .is_some_and(|aspect| self.registry.aspect(entity_type, aspect).is_some())
    }

    fn validate(&self, engine: &QueryEngine, entity_type: &str, reference: &PropertyRef) -> ValidationResult {
        match self.plan(entity_type, reference) {
            None => ValidationResult::invalid(format!(
                "实体类型 '{}' 没有切面 '{}'",
                entity_type,
                reference.segments().next().unwrap_or_default()
            )),
            Some(PathPlan::Local { .. }) => ValidationResult::valid(),
            Some(PathPlan::Hop { targets, remaining, .. }) => {
                let resolvable = targets.iter().any(|target| {
                    let target_types: BTreeSet<String> = [target.clone()].into_iter().collect();
                    engine.validate_reference(&remaining, &target_types).valid
                });
                if resolvable {
                    ValidationResult::valid()
                } else {
                    ValidationResult::invalid(format!(
                        "属性路径 '{}' 的剩余部分 '{}' 无法在引用目标 [{}] 上解析",
                        reference,
                        remaining,
                        targets.join(", ")
                    ))
                }
            }
        }
    }

    async fn resolve(
        &self,
        engine: &QueryEngine,
        entity_type: &str,
        urns: &BTreeSet<Urn>,
        references: &BTreeSet<PropertyRef>,
    ) -> Result<BatchResolution> {
        let plans: Vec<(&PropertyRef, PathPlan)> = references
            .iter()
            .filter_map(|reference| self.plan(entity_type, reference).map(|plan| (reference, plan)))
            .collect();
        if plans.is_empty() {
            return Ok(BatchResolution::new());
        }

        let aspects: BTreeSet<String> = plans.iter().map(|(_, plan)| plan.aspect().to_string()).collect();
        metrics::record_aspect_fetch(entity_type, self.name());
        let fetched = self.store.fetch_aspects(entity_type, urns, &aspects).await?;

        let mut resolution = BatchResolution::new();
        let mut hops: Vec<PendingHop<'_>> = Vec::new();

        for (urn, entity_aspects) in &fetched {
            for (reference, plan) in &plans {
                let Some(envelope) = entity_aspects.get(plan.aspect()) else {
                    continue;
                };
                let mut found = Vec::new();
                walk(&envelope.value, plan.fields(), &mut found);
                let values: Vec<String> = found.into_iter().filter_map(render).collect();
                if values.is_empty() {
                    continue;
                }

                match plan {
                    PathPlan::Local { .. } => {
                        resolution
                            .entry(urn.clone())
                            .or_default()
                            .insert((*reference).clone(), values);
                    }
                    PathPlan::Hop { remaining, .. } => {
                        let targets: Vec<Urn> = values
                            .iter()
                            .filter_map(|value| match Urn::parse(value.as_str()) {
                                Ok(target) => Some(target),
                                Err(_) => {
                                    debug!(value = %value, reference = %reference, "引用字段的值不是 URN，跳过");
                                    None
                                }
                            })
                            .collect();
                        if !targets.is_empty() {
                            hops.push(PendingHop {
                                source: urn.clone(),
                                reference: *reference,
                                remaining,
                                targets,
                            });
                        }
                    }
                }
            }
        }

        if hops.is_empty() {
            return Ok(resolution);
        }

        let mut requests: BTreeMap<String, TypeRequest> = BTreeMap::new();
        for hop in &hops {
            for target in &hop.targets {
                let request = requests.entry(target.entity_type().to_string()).or_default();
                request.urns.insert(target.clone());
                request.references.insert(hop.remaining.clone());
            }
        }
        let missing = self.missing_targets(engine, &mut requests).await?;
        if !missing.is_empty() {
            for hop in &mut hops {
                hop.targets.retain(|target| !missing.contains(target));
            }
        }
        trace!(hops = hops.len(), target_types = requests.len(), "解析跨实体引用");
        let nested = engine.resolve_requests(requests).await?;

        for hop in hops {
            let values: Vec<String> = hop
                .targets
                .iter()
                .filter_map(|target| nested.get(target)?.get(hop.remaining))
                .flatten()
                .cloned()
                .collect();
            if !values.is_empty() {
                resolution
                    .entry(hop.source)
                    .or_default()
                    .insert(hop.reference.clone(), values);
            }
        }

        Ok(resolution)
    }
}

/// 沿字段路径收集值，数组透明展开
fn walk<'v>(value: &'v Value, fields: &[String], found: &mut Vec<&'v Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                walk(item, fields, found);
            }
        }
        _ if fields.is_empty() => found.push(value),
        Value::Object(map) => {
            if let Some(child) = map.get(fields[0].as_str()) {
                walk(child, &fields[1..], found);
            }
        }
        _ => {}
    }
}

/// 叶子值的文本形式；null 视为缺失，对象渲染为 JSON
fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
