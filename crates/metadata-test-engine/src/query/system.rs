//! 系统元数据求值器
//!
//! 从实体全部切面的信封中推导同步与更新时间，调用方无需指定具体切面。
//! 取值均为 epoch 毫秒的十进制文本。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_shared::observability::metrics;

use super::registry::EntityRegistry;
use super::{BatchResolution, PathEvaluator, QueryEngine};
use crate::error::Result;
use crate::models::{EntityAspects, PropertyRef, ValidationResult};
use crate::traits::EntityStore;
use crate::urn::Urn;

/// 未提供 run id 时写入的占位值
const NO_RUN_ID: &str = "no-run-id-provided";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemField {
    /// 最早的切面创建时间
    FirstSynchronized,
    /// 有效 run id 的切面中最晚的观测时间
    LastSynchronized,
    /// 最晚的切面创建时间
    LastUpdated,
}

impl SystemField {
    fn parse(reference: &PropertyRef) -> Option<Self> {
        let path = reference.path();
        let name = path.strip_prefix("__").unwrap_or(path);
        [
            ("firstSynchronized", Self::FirstSynchronized),
            ("lastSynchronized", Self::LastSynchronized),
            ("lastUpdated", Self::LastUpdated),
        ]
        .into_iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, field)| field)
    }

    fn derive(self, aspects: &EntityAspects) -> Option<i64> {
        let created = aspects.values().filter_map(|aspect| aspect.created.as_ref().map(|c| c.time));
        match self {
            Self::FirstSynchronized => created.min(),
            Self::LastUpdated => created.max(),
            Self::LastSynchronized => aspects
                .values()
                .filter_map(|aspect| aspect.system_metadata.as_ref())
                .filter(|meta| meta.run_id.as_deref().is_some_and(|run_id| run_id != NO_RUN_ID))
                .filter_map(|meta| meta.last_observed)
                .max(),
        }
    }
}

pub struct SystemMetadataPathEvaluator {
    store: Arc<dyn EntityStore>,
    registry: Arc<EntityRegistry>,
}

impl SystemMetadataPathEvaluator {
    pub fn new(store: Arc<dyn EntityStore>, registry: Arc<EntityRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl PathEvaluator for SystemMetadataPathEvaluator {
    fn name(&self) -> &'static str {
        "system"
    }

    fn is_eligible(&self, entity_type: &str, reference: &PropertyRef) -> bool {
        self.registry.contains(entity_type) && SystemField::parse(reference).is_some()
    }

    fn validate(&self, _engine: &QueryEngine, _entity_type: &str, _reference: &PropertyRef) -> ValidationResult {
        ValidationResult::valid()
    }

    async fn resolve(
        &self,
        _engine: &QueryEngine,
        entity_type: &str,
        urns: &BTreeSet<Urn>,
        references: &BTreeSet<PropertyRef>,
    ) -> Result<BatchResolution> {
        let fields: Vec<(&PropertyRef, SystemField)> = references
            .iter()
            .filter_map(|reference| SystemField::parse(reference).map(|field| (reference, field)))
            .collect();
        if fields.is_empty() {
            return Ok(BatchResolution::new());
        }

        let aspects = self.registry.aspect_names(entity_type);
        metrics::record_aspect_fetch(entity_type, self.name());
        let fetched = self.store.fetch_aspects(entity_type, urns, &aspects).await?;

        Ok(fetched
            .into_iter()
            .map(|(urn, entity_aspects)| {
                let values = fields
                    .iter()
                    .filter_map(|(reference, field)| {
                        field
                            .derive(&entity_aspects)
                            .map(|time| ((*reference).clone(), vec![time.to_string()]))
                    })
                    .collect();
                (urn, values)
            })
            .collect())
    }
}
