//! 测试引擎
//!
//! 维护测试定义缓存，并按以下流水线评估实体：
//!
//! 1. 按实体类型筛选候选定义
//! 2. 批量解析并求值 `on.conditions`，得到最终适用的定义
//! 3. 合并所有适用定义的规则引用，一次批量解析后逐个求值
//! 4. 写入结果（全量覆盖，或针对部分测试与已有结果合并）
//! 5. 按 (动作, 实体集合) 分组后执行动作
//!
//! `EvaluateOnly` 模式只执行前三步。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use catalog_shared::config::TestEngineConfig;
use catalog_shared::observability::metrics;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheRefresher, CacheSnapshot, DefinitionCache, spawn_refresh_loop};
use crate::error::Result;
use crate::models::{PropertyRef, TestAction, TestDefinition, TestResults, ValidationResult};
use crate::parser::TestDefinitionParser;
use crate::predicate::{PredicateEvaluator, ResolvedValues};
use crate::query::{EntityRegistry, QueryEngine};
use crate::traits::{ActionApplier, DefinitionSource, EntityStore, ResultSink};
use crate::urn::Urn;

/// 测试结果切面名
pub const TEST_RESULTS_ASPECT: &str = "testResults";
/// 校验时使用的占位 id
const VALIDATION_TEST_ID: &str = "dummy";

/// 评估模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluationMode {
    /// 只评估，不写结果、不执行动作
    EvaluateOnly,
    /// 评估、写结果并执行动作
    #[default]
    Default,
}

/// 测试引擎依赖的外部协作方
#[derive(Clone)]
pub struct EngineCollaborators {
    pub definitions: Arc<dyn DefinitionSource>,
    pub entity_store: Arc<dyn EntityStore>,
    pub result_sink: Arc<dyn ResultSink>,
    pub action_applier: Arc<dyn ActionApplier>,
}

/// 评估哪些测试
#[derive(Debug, Clone, Copy)]
enum Selection<'a> {
    All,
    Only(&'a BTreeSet<String>),
}

impl Selection<'_> {
    fn includes(&self, definition: &TestDefinition) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(ids) => ids.contains(&definition.id),
        }
    }
}

/// 元数据测试引擎
pub struct TestEngine {
    cache: Arc<DefinitionCache>,
    refresher: Mutex<Option<CacheRefresher>>,
    query: QueryEngine,
    entity_store: Arc<dyn EntityStore>,
    result_sink: Arc<dyn ResultSink>,
    action_applier: Arc<dyn ActionApplier>,
    parser: TestDefinitionParser,
}

impl TestEngine {
    /// 创建引擎并启动后台缓存刷新任务，需在 tokio runtime 内调用
    pub fn new(
        collaborators: EngineCollaborators,
        registry: Arc<EntityRegistry>,
        config: &TestEngineConfig,
    ) -> Self {
        let cache = Arc::new(DefinitionCache::new(
            collaborators.definitions,
            config.page_size,
        ));
        let refresher = spawn_refresh_loop(
            cache.clone(),
            Duration::from_secs(config.refresh_interval_secs.max(1)),
        );
        let query = QueryEngine::standard(collaborators.entity_store.clone(), registry);

        Self {
            cache,
            refresher: Mutex::new(Some(refresher)),
            query,
            entity_store: collaborators.entity_store,
            result_sink: collaborators.result_sink,
            action_applier: collaborators.action_applier,
            parser: TestDefinitionParser::new(),
        }
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }

    /// 当前缓存快照
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.snapshot()
    }

    /// 缓存中定义所覆盖的实体类型
    pub fn entity_types_to_evaluate(&self) -> BTreeSet<String> {
        self.cache.snapshot().entity_types()
    }

    /// 通知后台任务尽快刷新缓存
    pub fn invalidate_cache(&self) {
        if let Some(refresher) = self.refresher.lock().as_ref() {
            refresher.invalidate();
        }
    }

    /// 立即执行一轮刷新，返回加载的定义数
    pub async fn refresh_now(&self) -> Result<usize> {
        self.cache.refresh().await
    }

    /// 停止后台刷新任务
    pub async fn shutdown(&self) {
        let refresher = self.refresher.lock().take();
        if let Some(refresher) = refresher {
            refresher.shutdown().await;
        }
    }

    /// 评估单个实体上的全部适用测试
    pub async fn evaluate(&self, urn: &Urn, mode: EvaluationMode) -> Result<TestResults> {
        let urns: BTreeSet<Urn> = [urn.clone()].into_iter().collect();
        let mut results = self.run(&urns, Selection::All, mode).await?;
        Ok(results.remove(urn).unwrap_or_default())
    }

    /// 评估单个实体上的指定测试
    pub async fn evaluate_tests(
        &self,
        urn: &Urn,
        test_ids: &BTreeSet<String>,
        mode: EvaluationMode,
    ) -> Result<TestResults> {
        let urns: BTreeSet<Urn> = [urn.clone()].into_iter().collect();
        let mut results = self.run(&urns, Selection::Only(test_ids), mode).await?;
        Ok(results.remove(urn).unwrap_or_default())
    }

    /// 批量评估实体上的全部适用测试
    pub async fn batch_evaluate(
        &self,
        urns: &BTreeSet<Urn>,
        mode: EvaluationMode,
    ) -> Result<HashMap<Urn, TestResults>> {
        self.run(urns, Selection::All, mode).await
    }

    /// 批量评估实体上的指定测试
    pub async fn batch_evaluate_tests(
        &self,
        urns: &BTreeSet<Urn>,
        test_ids: &BTreeSet<String>,
        mode: EvaluationMode,
    ) -> Result<HashMap<Urn, TestResults>> {
        self.run(urns, Selection::Only(test_ids), mode).await
    }

    /// 静态校验一份测试定义，汇总全部问题
    pub fn validate(&self, definition_json: &str) -> ValidationResult {
        let definition = match self.parser.parse(VALIDATION_TEST_ID, definition_json) {
            Ok(definition) => definition,
            Err(e) => return ValidationResult::invalid(e.to_string()),
        };

        let entity_types = &definition.targeting.entity_types;
        let mut references: BTreeSet<PropertyRef> =
            PredicateEvaluator::extract_references(&definition.rules).into_iter().collect();
        if let Some(conditions) = &definition.targeting.conditions {
            references.extend(PredicateEvaluator::extract_references(conditions));
        }

        let mut result = references
            .iter()
            .map(|reference| self.query.validate_reference(reference, entity_types))
            .fold(ValidationResult::valid(), ValidationResult::merge);

        for action in definition
            .actions
            .passing
            .iter()
            .chain(definition.actions.failing.iter())
        {
            if let Err(e) = self.action_applier.validate_params(action.kind, &action.params) {
                result = result.merge(ValidationResult::invalid(e.to_string()));
            }
        }
        result
    }

    #[instrument(skip(self, urns, selection), fields(urns = urns.len()))]
    async fn run(
        &self,
        urns: &BTreeSet<Urn>,
        selection: Selection<'_>,
        mode: EvaluationMode,
    ) -> Result<HashMap<Urn, TestResults>> {
        let started = Instant::now();
        let snapshot = self.cache.snapshot();

        if let Selection::Only(ids) = selection {
            for id in ids.iter().filter(|id| snapshot.get(id).is_none()) {
                warn!(test = %id, "缓存中没有该测试定义，已跳过");
            }
        }

        // 阶段一：按实体类型筛选
        let candidates: BTreeMap<&Urn, Vec<&Arc<TestDefinition>>> = urns
            .iter()
            .map(|urn| {
                let definitions = snapshot
                    .for_entity_type(urn.entity_type())
                    .iter()
                    .filter(|definition| selection.includes(definition))
                    .collect();
                (urn, definitions)
            })
            .collect();

        // 阶段二：条件筛选
        let eligible = self.select_eligible(&candidates).await?;

        // 规则求值
        let rule_urns: BTreeSet<Urn> = eligible
            .iter()
            .filter(|(_, definitions)| !definitions.is_empty())
            .map(|(urn, _)| (*urn).clone())
            .collect();
        let rule_references: BTreeSet<PropertyRef> = eligible
            .values()
            .flatten()
            .flat_map(|definition| PredicateEvaluator::extract_references(&definition.rules))
            .collect();
        let resolution = self.query.batch_resolve(&rule_urns, &rule_references).await?;

        let empty = ResolvedValues::new();
        let mut results: HashMap<Urn, TestResults> = HashMap::new();
        for (urn, definitions) in &eligible {
            let values = resolution.get(*urn).unwrap_or(&empty);
            let entry = results.entry((*urn).clone()).or_default();
            for definition in definitions {
                let passed = PredicateEvaluator::evaluate(&definition.rules, values)?;
                debug!(urn = %urn, test = %definition.id, passed, "测试评估完成");
                metrics::record_test_evaluation(urn.entity_type(), passed);
                entry.record(&definition.id, passed);
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        for entity_type in urns.iter().map(Urn::entity_type).collect::<BTreeSet<_>>() {
            metrics::record_evaluation_duration(entity_type, elapsed);
        }

        if mode == EvaluationMode::Default {
            self.persist(&results, selection, &snapshot).await?;
            self.apply_actions(&results, &snapshot).await;
        }

        info!(
            urns = urns.len(),
            outcomes = results.values().map(TestResults::len).sum::<usize>(),
            duration_ms = started.elapsed().as_millis() as u64,
            "实体测试评估完成"
        );
        Ok(results)
    }

    /// 求值 `on.conditions`，没有条件的定义直接适用
    async fn select_eligible<'s>(
        &self,
        candidates: &BTreeMap<&'s Urn, Vec<&'s Arc<TestDefinition>>>,
    ) -> Result<BTreeMap<&'s Urn, Vec<&'s Arc<TestDefinition>>>> {
        let mut condition_urns = BTreeSet::new();
        let mut condition_references = BTreeSet::new();
        for (urn, definitions) in candidates {
            for definition in definitions {
                if let Some(conditions) = &definition.targeting.conditions {
                    condition_urns.insert((*urn).clone());
                    condition_references.extend(PredicateEvaluator::extract_references(conditions));
                }
            }
        }

        let resolution = self
            .query
            .batch_resolve(&condition_urns, &condition_references)
            .await?;

        let empty = ResolvedValues::new();
        let mut eligible = BTreeMap::new();
        for (urn, definitions) in candidates {
            let values = resolution.get(*urn).unwrap_or(&empty);
            let mut selected = Vec::with_capacity(definitions.len());
            for definition in definitions {
                let applies = match &definition.targeting.conditions {
                    None => true,
                    Some(conditions) => PredicateEvaluator::evaluate(conditions, values)?,
                };
                if applies {
                    selected.push(*definition);
                } else {
                    debug!(urn = %urn, test = %definition.id, "实体不满足测试的适用条件");
                }
            }
            eligible.insert(*urn, selected);
        }
        Ok(eligible)
    }

    /// 写入结果：全量评估直接覆盖，部分评估与已有结果合并
    async fn persist(
        &self,
        results: &HashMap<Urn, TestResults>,
        selection: Selection<'_>,
        snapshot: &CacheSnapshot,
    ) -> Result<()> {
        let merged = match selection {
            Selection::All => results.clone(),
            Selection::Only(ids) => {
                let evaluated: HashSet<String> = ids
                    .iter()
                    .filter(|id| snapshot.get(id).is_some())
                    .cloned()
                    .collect();
                let mut prior = self.load_prior_results(results.keys()).await?;
                results
                    .iter()
                    .map(|(urn, current)| {
                        let previous = prior.remove(urn).unwrap_or_default();
                        (urn.clone(), current.clone().merge_with_prior(previous, &evaluated))
                    })
                    .collect()
            }
        };

        let mut ordered: Vec<(&Urn, &TestResults)> = merged.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));
        for (urn, results) in ordered {
            self.result_sink.persist_result(urn, results).await?;
        }
        Ok(())
    }

    /// 读取已存储的测试结果，按实体类型批量读取
    async fn load_prior_results<'u>(
        &self,
        urns: impl Iterator<Item = &'u Urn>,
    ) -> Result<HashMap<Urn, TestResults>> {
        let mut by_type: BTreeMap<String, BTreeSet<Urn>> = BTreeMap::new();
        for urn in urns {
            by_type
                .entry(urn.entity_type().to_string())
                .or_default()
                .insert(urn.clone());
        }

        let aspects: BTreeSet<String> = [TEST_RESULTS_ASPECT.to_string()].into_iter().collect();
        let mut prior = HashMap::new();
        for (entity_type, urns) in by_type {
            let fetched = self
                .entity_store
                .fetch_aspects(&entity_type, &urns, &aspects)
                .await?;
            for (urn, mut entity_aspects) in fetched {
                let Some(envelope) = entity_aspects.remove(TEST_RESULTS_ASPECT) else {
                    continue;
                };
                match serde_json::from_value::<TestResults>(envelope.value) {
                    Ok(results) => {
                        prior.insert(urn, results);
                    }
                    Err(e) => {
                        warn!(urn = %urn, error = %e, "已存储的测试结果无法解析，按空结果处理");
                    }
                }
            }
        }
        Ok(prior)
    }

    /// 按 (动作, 实体集合) 分组执行；单个批次失败只记录日志
    async fn apply_actions(&self, results: &HashMap<Urn, TestResults>, snapshot: &CacheSnapshot) {
        let mut grouped: BTreeMap<&TestAction, BTreeSet<Urn>> = BTreeMap::new();
        for (urn, entity_results) in results {
            for outcome in entity_results.outcomes() {
                let Some(definition) = snapshot.get(&outcome.test_id) else {
                    continue;
                };
                for action in definition.actions.for_verdict(outcome.verdict) {
                    grouped.entry(action).or_default().insert(urn.clone());
                }
            }
        }

        for (action, urns) in grouped {
            let urns: Vec<Urn> = urns.into_iter().collect();
            match self
                .action_applier
                .apply_action(action.kind, &urns, &action.params)
                .await
            {
                Ok(()) => {
                    debug!(kind = %action.kind, urns = urns.len(), "动作执行完成");
                    metrics::record_action_applied(action.kind.as_str(), true);
                }
                Err(e) => {
                    error!(kind = %action.kind, urns = urns.len(), error = %e, "动作执行失败");
                    metrics::record_action_applied(action.kind.as_str(), false);
                }
            }
        }
    }
}
