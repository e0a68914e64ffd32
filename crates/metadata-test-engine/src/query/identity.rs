//! 标识字段求值器：`urn` 与 `entityType` 直接由 URN 得出，无需访问存储

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{BatchResolution, PathEvaluator, QueryEngine};
use crate::error::Result;
use crate::models::{PropertyRef, ValidationResult};
use crate::urn::Urn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityField {
    Urn,
    EntityType,
}

impl IdentityField {
    fn parse(reference: &PropertyRef) -> Option<Self> {
        let path = reference.path();
        if path.eq_ignore_ascii_case("urn") {
            Some(Self::Urn)
        } else if path.eq_ignore_ascii_case("entityType") {
            Some(Self::EntityType)
        } else {
            None
        }
    }

    fn value(self, urn: &Urn) -> String {
        match self {
            Self::Urn => urn.to_string(),
            Self::EntityType => urn.entity_type().to_string(),
        }
    }
}

pub struct IdentityPathEvaluator;

#[async_trait]
impl PathEvaluator for IdentityPathEvaluator {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn is_eligible(&self, _entity_type: &str, reference: &PropertyRef) -> bool {
        IdentityField::parse(reference).is_some()
    }

    fn validate(&self, _engine: &QueryEngine, _entity_type: &str, _reference: &PropertyRef) -> ValidationResult {
        ValidationResult::valid()
    }

    fn reads_store(&self) -> bool {
        false
    }

    async fn resolve(
        &self,
        _engine: &QueryEngine,
        _entity_type: &str,
        urns: &BTreeSet<Urn>,
        references: &BTreeSet<PropertyRef>,
    ) -> Result<BatchResolution> {
        let fields: Vec<(&PropertyRef, IdentityField)> = references
            .iter()
            .filter_map(|reference| IdentityField::parse(reference).map(|field| (reference, field)))
            .collect();

        Ok(urns
            .iter()
            .map(|urn| {
                let values = fields
                    .iter()
                    .map(|(reference, field)| ((*reference).clone(), vec![field.value(urn)]))
                    .collect();
                (urn.clone(), values)
            })
            .collect())
    }
}
