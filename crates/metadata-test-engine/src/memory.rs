//! 内存协作方
//!
//! 使用 DashMap 保存实体切面与测试定义，同时实现 [`EntityStore`]、[`ResultSink`]、
//! [`EntitySearch`] 与 [`DefinitionSource`]，供命令行工具与集成测试使用。
//! 另提供一组直接修改内存切面的动作处理器。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::actions::{ActionArguments, ActionHandler, ActionRegistry};
use crate::engine::TEST_RESULTS_ASPECT;
use crate::error::{Result, TestEngineError};
use crate::models::{
    ActionKind, ActionParams, AuditStamp, DefinitionPage, EntityAspects, EnvelopedAspect,
    RawTestDefinition, ScrollPage, TestResults,
};
use crate::traits::{DefinitionSource, EntitySearch, EntityStore, ResultSink};
use crate::urn::Urn;

/// 夹具文件格式
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    definitions: Vec<FixtureDefinition>,
    #[serde(default)]
    entities: Vec<FixtureEntity>,
}

#[derive(Debug, Deserialize)]
struct FixtureDefinition {
    id: String,
    /// 字符串或内联的 JSON 对象
    definition: Value,
}

#[derive(Debug, Deserialize)]
struct FixtureEntity {
    urn: Urn,
    #[serde(default)]
    aspects: EntityAspects,
}

/// 内存元数据存储
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetadataStore {
    entities: Arc<DashMap<Urn, EntityAspects>>,
    definitions: Arc<RwLock<Vec<RawTestDefinition>>>,
    fetches: Arc<AtomicUsize>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 夹具加载
    pub fn from_fixture(json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let store = Self::new();
        for definition in fixture.definitions {
            let raw = match definition.definition {
                Value::String(text) => text,
                other => other.to_string(),
            };
            store.put_definition(&definition.id, raw);
        }
        for entity in fixture.entities {
            store.insert_entity(entity.urn, entity.aspects);
        }
        Ok(store)
    }

    /// 新增或替换测试定义，保持首次写入的位置
    pub fn put_definition(&self, id: &str, definition: impl Into<String>) {
        let mut definitions = self.definitions.write();
        let raw = RawTestDefinition {
            id: id.to_string(),
            definition: definition.into(),
        };
        match definitions.iter_mut().find(|existing| existing.id == id) {
            Some(existing) => *existing = raw,
            None => definitions.push(raw),
        }
    }

    pub fn remove_definition(&self, id: &str) -> bool {
        let mut definitions = self.definitions.write();
        let before = definitions.len();
        definitions.retain(|existing| existing.id != id);
        definitions.len() != before
    }

    pub fn insert_entity(&self, urn: Urn, aspects: EntityAspects) {
        self.entities.insert(urn, aspects);
    }

    pub fn upsert_aspect(&self, urn: &Urn, name: &str, aspect: EnvelopedAspect) {
        self.entities
            .entry(urn.clone())
            .or_default()
            .insert(name.to_string(), aspect);
    }

    pub fn aspect(&self, urn: &Urn, name: &str) -> Option<EnvelopedAspect> {
        self.entities.get(urn)?.get(name).cloned()
    }

    /// 已写入的测试结果
    pub fn test_results(&self, urn: &Urn) -> Option<TestResults> {
        let aspect = self.aspect(urn, TEST_RESULTS_ASPECT)?;
        serde_json::from_value(aspect.value).ok()
    }

    /// 指定类型的全部实体，按 URN 排序
    pub fn urns(&self, entity_type: &str) -> Vec<Urn> {
        let mut urns: Vec<Urn> = self
            .entities
            .iter()
            .filter(|entry| entry.key().entity_type() == entity_type)
            .map(|entry| entry.key().clone())
            .collect();
        urns.sort();
        urns
    }

    /// `fetch_aspects` 的调用次数
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// 修改切面值并刷新创建时间，切面不存在时从空对象开始
    pub fn modify_aspect(&self, urn: &Urn, name: &str, patch: impl FnOnce(&mut Value)) {
        let mut entity = self.entities.entry(urn.clone()).or_default();
        let aspect = entity
            .entry(name.to_string())
            .or_insert_with(|| EnvelopedAspect::new(json!({})));
        patch(&mut aspect.value);
        aspect.created = Some(AuditStamp {
            time: Utc::now().timestamp_millis(),
            actor: None,
        });
    }

    /// 为每种动作注册修改内存切面的处理器
    pub fn action_registry(&self) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        for kind in ActionKind::ALL {
            registry.register(Arc::new(AspectPatchHandler {
                store: self.clone(),
                kind,
            }));
        }
        registry
    }
}

#[async_trait]
impl EntityStore for InMemoryMetadataStore {
    async fn fetch_aspects(
        &self,
        _entity_type: &str,
        urns: &BTreeSet<Urn>,
        aspects: &BTreeSet<String>,
    ) -> Result<HashMap<Urn, EntityAspects>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(urns
            .iter()
            .filter_map(|urn| {
                let entity = self.entities.get(urn)?;
                let selected: EntityAspects = entity
                    .iter()
                    .filter(|(name, _)| aspects.contains(*name))
                    .map(|(name, aspect)| (name.clone(), aspect.clone()))
                    .collect();
                Some((urn.clone(), selected))
            })
            .collect())
    }
}

#[async_trait]
impl ResultSink for InMemoryMetadataStore {
    async fn persist_result(&self, urn: &Urn, results: &TestResults) -> Result<()> {
        let value = serde_json::to_value(results)?;
        let aspect = EnvelopedAspect::new(value).with_created(Utc::now().timestamp_millis());
        self.upsert_aspect(urn, TEST_RESULTS_ASPECT, aspect);
        Ok(())
    }
}

#[async_trait]
impl EntitySearch for InMemoryMetadataStore {
    async fn scroll(
        &self,
        entity_type: &str,
        batch_size: usize,
        cursor: Option<String>,
    ) -> Result<ScrollPage> {
        let offset = match cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| TestEngineError::Search(format!("无效的游标 '{}'", cursor)))?,
        };
        let urns = self.urns(entity_type);
        let end = (offset + batch_size.max(1)).min(urns.len());
        let page: Vec<Urn> = urns.get(offset..end).map(<[Urn]>::to_vec).unwrap_or_default();
        Ok(ScrollPage {
            urns: page,
            next_cursor: (end < urns.len()).then(|| end.to_string()),
        })
    }
}

#[async_trait]
impl DefinitionSource for InMemoryMetadataStore {
    async fn fetch_definitions(&self, offset: usize, count: usize) -> Result<DefinitionPage> {
        let definitions = self.definitions.read();
        Ok(DefinitionPage {
            items: definitions.iter().skip(offset).take(count).cloned().collect(),
            total: definitions.len(),
        })
    }
}

// ==================== 动作处理器 ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// 动作修改的切面位置：切面名、列表字段、列表元素中的 URN 字段
struct PatchTarget {
    aspect: &'static str,
    list: &'static str,
    key: Option<&'static str>,
}

fn patch_plan(kind: ActionKind) -> (PatchTarget, PatchOp) {
    let tags = PatchTarget {
        aspect: "globalTags",
        list: "tags",
        key: Some("tag"),
    };
    let terms = PatchTarget {
        aspect: "glossaryTerms",
        list: "terms",
        key: Some("urn"),
    };
    let domains = PatchTarget {
        aspect: "domains",
        list: "domains",
        key: None,
    };
    let owners = PatchTarget {
        aspect: "ownership",
        list: "owners",
        key: Some("owner"),
    };

    match kind {
        ActionKind::AddTags => (tags, PatchOp::Add),
        ActionKind::RemoveTags => (tags, PatchOp::Remove),
        ActionKind::AddGlossaryTerms => (terms, PatchOp::Add),
        ActionKind::RemoveGlossaryTerms => (terms, PatchOp::Remove),
        ActionKind::SetDomain | ActionKind::UnsetDomain => (domains, PatchOp::Replace),
        ActionKind::AddDomains => (domains, PatchOp::Add),
        ActionKind::RemoveDomains => (domains, PatchOp::Remove),
        ActionKind::AddOwners => (owners, PatchOp::Add),
        ActionKind::RemoveOwners => (owners, PatchOp::Remove),
    }
}

/// 直接修改内存切面的动作处理器
pub struct AspectPatchHandler {
    store: InMemoryMetadataStore,
    kind: ActionKind,
}

#[async_trait]
impl ActionHandler for AspectPatchHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    async fn apply(&self, urns: &[Urn], params: &ActionParams) -> Result<()> {
        let arguments = ActionArguments::parse(self.kind, params)?;
        let (target, op) = patch_plan(self.kind);
        for urn in urns {
            self.store.modify_aspect(urn, target.aspect, |value| {
                patch_list(value, &target, op, &arguments);
            });
        }
        debug!(kind = %self.kind, urns = urns.len(), "已修改内存切面");
        Ok(())
    }
}

fn item_id<'v>(item: &'v Value, key: Option<&str>) -> Option<&'v str> {
    match key {
        Some(key) => item.get(key)?.as_str(),
        None => item.as_str(),
    }
}

fn make_item(urn: &Urn, target: &PatchTarget, arguments: &ActionArguments) -> Value {
    let Some(key) = target.key else {
        return Value::String(urn.to_string());
    };
    let mut item = Map::new();
    item.insert(key.to_string(), Value::String(urn.to_string()));
    if target.aspect == "ownership" {
        item.insert("type".to_string(), Value::String(arguments.ownership_type.clone()));
    }
    Value::Object(item)
}

fn patch_list(value: &mut Value, target: &PatchTarget, op: PatchOp, arguments: &ActionArguments) {
    if !value.is_object() {
        *value = json!({});
    }
    let Some(object) = value.as_object_mut() else {
        return;
    };
    let list = object
        .entry(target.list)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !list.is_array() {
        *list = Value::Array(Vec::new());
    }
    let Some(items) = list.as_array_mut() else {
        return;
    };

    if op == PatchOp::Replace {
        items.clear();
    }
    if op == PatchOp::Remove {
        items.retain(|item| {
            !arguments
                .values
                .iter()
                .any(|urn| item_id(item, target.key) == Some(urn.as_str()))
        });
        return;
    }
    for urn in &arguments.values {
        if !items.iter().any(|item| item_id(item, target.key) == Some(urn.as_str())) {
            items.push(make_item(urn, target, arguments));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Verdict;
    use crate::traits::ActionApplier;

    fn urn(raw: &str) -> Urn {
        Urn::parse(raw).unwrap()
    }

    fn params(values: &[&str]) -> ActionParams {
        let mut params = ActionParams::new();
        params.insert(
            "values".to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        params
    }

    const FIXTURE: &str = r#"{
        "definitions": [
            {"id": "t1", "definition": {"on": {"types": ["dataset"]}, "rules": {"property": "urn", "operator": "exists"}}},
            {"id": "t2", "definition": "{\"on\": {\"types\": [\"chart\"]}, \"rules\": {\"property\": \"urn\", \"operator\": \"exists\"}}"}
        ],
        "entities": [
            {"urn": "urn:li:dataset:b", "aspects": {"globalTags": {"value": {"tags": [{"tag": "urn:li:tag:pii"}]}}}},
            {"urn": "urn:li:dataset:a", "aspects": {}},
            {"urn": "urn:li:chart:c"}
        ]
    }"#;

    #[tokio::test]
    async fn test_fixture_and_collaborators() {
        let store = InMemoryMetadataStore::from_fixture(FIXTURE).unwrap();

        let page = store.fetch_definitions(1, 10).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, "t2");

        let urns: BTreeSet<Urn> = [urn("urn:li:dataset:a"), urn("urn:li:dataset:b"), urn("urn:li:dataset:zz")]
            .into_iter()
            .collect();
        let aspects: BTreeSet<String> = ["globalTags".to_string()].into_iter().collect();
        let fetched = store.fetch_aspects("dataset", &urns, &aspects).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched[&urn("urn:li:dataset:a")].is_empty());
        assert_eq!(
            fetched[&urn("urn:li:dataset:b")]["globalTags"].value["tags"][0]["tag"],
            "urn:li:tag:pii"
        );
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_scroll_pages_in_urn_order() {
        let store = InMemoryMetadataStore::from_fixture(FIXTURE).unwrap();

        let first = store.scroll("dataset", 1, None).await.unwrap();
        assert_eq!(first.urns, vec![urn("urn:li:dataset:a")]);
        let second = store.scroll("dataset", 1, first.next_cursor).await.unwrap();
        assert_eq!(second.urns, vec![urn("urn:li:dataset:b")]);
        assert!(second.next_cursor.is_none());

        assert!(store.scroll("dataset", 1, Some("x".to_string())).await.is_err());
        assert!(store.scroll("tag", 10, None).await.unwrap().urns.is_empty());
    }

    #[tokio::test]
    async fn test_persist_result_writes_aspect() {
        let store = InMemoryMetadataStore::new();
        let target = urn("urn:li:dataset:a");
        let mut results = TestResults::default();
        results.record("t1", false);

        store.persist_result(&target, &results).await.unwrap();
        let stored = store.test_results(&target).unwrap();
        assert_eq!(stored.failing[0].verdict, Verdict::Failure);
        assert!(store.aspect(&target, TEST_RESULTS_ASPECT).unwrap().created.is_some());
    }

    #[tokio::test]
    async fn test_patch_handlers() {
        let store = InMemoryMetadataStore::from_fixture(FIXTURE).unwrap();
        let registry = store.action_registry();
        let targets = vec![urn("urn:li:dataset:a"), urn("urn:li:dataset:b")];

        registry
            .apply_action(ActionKind::AddTags, &targets, &params(&["urn:li:tag:pii", "urn:li:tag:gold"]))
            .await
            .unwrap();
        let tags = store.aspect(&targets[1], "globalTags").unwrap().value;
        assert_eq!(tags["tags"].as_array().unwrap().len(), 2);

        registry
            .apply_action(ActionKind::RemoveTags, &targets, &params(&["urn:li:tag:pii"]))
            .await
            .unwrap();
        let tags = store.aspect(&targets[0], "globalTags").unwrap().value;
        assert_eq!(tags, json!({"tags": [{"tag": "urn:li:tag:gold"}]}));

        registry
            .apply_action(ActionKind::SetDomain, &targets[..1], &params(&["urn:li:domain:finance"]))
            .await
            .unwrap();
        registry
            .apply_action(ActionKind::SetDomain, &targets[..1], &params(&["urn:li:domain:sales"]))
            .await
            .unwrap();
        let domains = store.aspect(&targets[0], "domains").unwrap().value;
        assert_eq!(domains, json!({"domains": ["urn:li:domain:sales"]}));

        registry
            .apply_action(ActionKind::UnsetDomain, &targets[..1], &ActionParams::new())
            .await
            .unwrap();
        let domains = store.aspect(&targets[0], "domains").unwrap().value;
        assert_eq!(domains, json!({"domains": []}));

        let mut owner = params(&["urn:li:corpuser:jdoe"]);
        owner.insert("type".to_string(), vec!["DATA_STEWARD".to_string()]);
        registry
            .apply_action(ActionKind::AddOwners, &targets[..1], &owner)
            .await
            .unwrap();
        let ownership = store.aspect(&targets[0], "ownership").unwrap().value;
        assert_eq!(
            ownership,
            json!({"owners": [{"owner": "urn:li:corpuser:jdoe", "type": "DATA_STEWARD"}]})
        );
    }
}
