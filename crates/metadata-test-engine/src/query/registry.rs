//! 实体注册表
//!
//! 记录每种实体类型拥有的切面，以及切面中哪些字段保存了指向其他实体的 URN。
//! 切面路径求值器依据这里的引用字段判断何时需要跨实体跳转。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 切面字段描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectSpec {
    /// 引用字段路径（相对切面根） -> 可能指向的实体类型
    #[serde(default)]
    pub references: BTreeMap<String, Vec<String>>,
}

impl AspectSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(mut self, field_path: &str, targets: &[&str]) -> Self {
        self.references.insert(
            field_path.to_string(),
            targets.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn reference_targets(&self, field_path: &str) -> Option<&[String]> {
        self.references.get(field_path).map(Vec::as_slice)
    }
}

/// 实体类型描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpec {
    pub key_aspect: String,
    #[serde(default)]
    pub aspects: BTreeMap<String, AspectSpec>,
}

impl EntitySpec {
    pub fn new(key_aspect: &str) -> Self {
        let mut aspects = BTreeMap::new();
        aspects.insert(key_aspect.to_string(), AspectSpec::new());
        Self {
            key_aspect: key_aspect.to_string(),
            aspects,
        }
    }

    pub fn with_aspect(mut self, name: &str, spec: AspectSpec) -> Self {
        self.aspects.insert(name.to_string(), spec);
        self
    }

    /// 添加若干不含引用字段的切面
    pub fn with_plain_aspects(mut self, names: &[&str]) -> Self {
        for name in names {
            self.aspects.entry(name.to_string()).or_default();
        }
        self
    }
}

/// 实体注册表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRegistry {
    entities: HashMap<String, EntitySpec>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册实体类型，已存在时覆盖
    pub fn register(&mut self, entity_type: &str, spec: EntitySpec) -> &mut Self {
        self.entities.insert(entity_type.to_string(), spec);
        self
    }

    /// 从 JSON 加载：`{ entityType: { keyAspect, aspects: { name: { references } } } }`
    pub fn from_json(json: &str) -> Result<Self> {
        let mut registry: EntityRegistry = serde_json::from_str(json)?;
        for spec in registry.entities.values_mut() {
            let key = spec.key_aspect.clone();
            spec.aspects.entry(key).or_default();
        }
        Ok(registry)
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntitySpec> {
        self.entities.get(entity_type)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.entities.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> BTreeSet<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn aspect(&self, entity_type: &str, aspect: &str) -> Option<&AspectSpec> {
        self.entity(entity_type)?.aspects.get(aspect)
    }

    /// 实体类型的全部切面名（含主键切面）
    pub fn aspect_names(&self, entity_type: &str) -> BTreeSet<String> {
        self.entity(entity_type)
            .map(|spec| spec.aspects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn key_aspect(&self, entity_type: &str) -> Option<&str> {
        self.entity(entity_type).map(|spec| spec.key_aspect.as_str())
    }

    /// 内置的标准注册表
    pub fn standard() -> Self {
        let ownership = AspectSpec::new().with_reference("owners.owner", &["corpuser", "corpGroup"]);
        let global_tags = AspectSpec::new().with_reference("tags.tag", &["tag"]);
        let glossary_terms = AspectSpec::new().with_reference("terms.urn", &["glossaryTerm"]);
        let domains = AspectSpec::new().with_reference("domains", &["domain"]);
        let container = AspectSpec::new().with_reference("container", &["container"]);
        let platform_instance = AspectSpec::new().with_reference("platform", &["dataPlatform"]);

        // 数据资产共有的切面
        let asset = |key: &str| {
            EntitySpec::new(key)
                .with_aspect("ownership", ownership.clone())
                .with_aspect("globalTags", global_tags.clone())
                .with_aspect("glossaryTerms", glossary_terms.clone())
                .with_aspect("domains", domains.clone())
                .with_aspect("container", container.clone())
                .with_aspect("dataPlatformInstance", platform_instance.clone())
                .with_plain_aspects(&[
                    "status",
                    "subTypes",
                    "deprecation",
                    "browsePaths",
                    "institutionalMemory",
                    "testResults",
                ])
        };

        let mut registry = Self::new();
        registry
            .register(
                "dataset",
                asset("datasetKey")
                    .with_aspect(
                        "upstreamLineage",
                        AspectSpec::new().with_reference("upstreams.dataset", &["dataset"]),
                    )
                    .with_aspect(
                        "schemaMetadata",
                        AspectSpec::new().with_reference("platform", &["dataPlatform"]),
                    )
                    .with_plain_aspects(&[
                        "datasetProperties",
                        "editableDatasetProperties",
                        "editableSchemaMetadata",
                        "datasetProfile",
                    ]),
            )
            .register(
                "chart",
                asset("chartKey")
                    .with_aspect(
                        "chartInfo",
                        AspectSpec::new().with_reference("inputs", &["dataset"]),
                    )
                    .with_plain_aspects(&["editableChartProperties"]),
            )
            .register(
                "dashboard",
                asset("dashboardKey")
                    .with_aspect(
                        "dashboardInfo",
                        AspectSpec::new()
                            .with_reference("charts", &["chart"])
                            .with_reference("datasets", &["dataset"]),
                    )
                    .with_plain_aspects(&["editableDashboardProperties"]),
            )
            .register(
                "dataJob",
                asset("dataJobKey")
                    .with_aspect(
                        "dataJobInputOutput",
                        AspectSpec::new()
                            .with_reference("inputDatasets", &["dataset"])
                            .with_reference("outputDatasets", &["dataset"]),
                    )
                    .with_plain_aspects(&["dataJobInfo", "editableDataJobProperties"]),
            )
            .register(
                "dataFlow",
                asset("dataFlowKey").with_plain_aspects(&["dataFlowInfo", "editableDataFlowProperties"]),
            )
            .register(
                "container",
                asset("containerKey")
                    .with_plain_aspects(&["containerProperties", "editableContainerProperties"]),
            )
            .register(
                "glossaryTerm",
                EntitySpec::new("glossaryTermKey")
                    .with_aspect(
                        "glossaryTermInfo",
                        AspectSpec::new().with_reference("parentNode", &["glossaryNode"]),
                    )
                    .with_aspect("ownership", ownership.clone())
                    .with_aspect("domains", domains.clone())
                    .with_plain_aspects(&["status", "deprecation"]),
            )
            .register(
                "glossaryNode",
                EntitySpec::new("glossaryNodeKey")
                    .with_aspect(
                        "glossaryNodeInfo",
                        AspectSpec::new().with_reference("parentNode", &["glossaryNode"]),
                    )
                    .with_aspect("ownership", ownership.clone()),
            )
            .register(
                "domain",
                EntitySpec::new("domainKey")
                    .with_aspect("ownership", ownership.clone())
                    .with_plain_aspects(&["domainProperties"]),
            )
            .register(
                "tag",
                EntitySpec::new("tagKey")
                    .with_aspect("ownership", ownership.clone())
                    .with_plain_aspects(&["tagProperties", "status"]),
            )
            .register(
                "corpuser",
                EntitySpec::new("corpUserKey")
                    .with_aspect(
                        "corpUserInfo",
                        AspectSpec::new().with_reference("managerUrn", &["corpuser"]),
                    )
                    .with_aspect("globalTags", global_tags)
                    .with_plain_aspects(&["corpUserEditableInfo", "corpUserStatus", "status"]),
            )
            .register(
                "corpGroup",
                EntitySpec::new("corpGroupKey")
                    .with_aspect("ownership", ownership)
                    .with_plain_aspects(&["corpGroupInfo", "corpGroupEditableInfo", "status"]),
            )
            .register(
                "dataPlatform",
                EntitySpec::new("dataPlatformKey").with_plain_aspects(&["dataPlatformInfo"]),
            );
        registry
    }
}
