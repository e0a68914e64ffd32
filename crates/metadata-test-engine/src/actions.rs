//! 动作处理器注册表
//!
//! 每种 [`ActionKind`] 对应一个 [`ActionHandler`]，注册表按类型路由，
//! 并作为 [`ActionApplier`] 交给测试引擎使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TestEngineError};
use crate::models::{ActionKind, ActionParams};
use crate::traits::ActionApplier;
use crate::urn::Urn;

pub const VALUES_PARAM: &str = "values";
pub const OWNERSHIP_TYPE_PARAM: &str = "type";
/// 未指定所有权类型时使用
pub const DEFAULT_OWNERSHIP_TYPE: &str = "NONE";

/// 动作处理器
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// 校验参数，默认使用 [`ActionArguments::parse`] 的规则
    fn validate(&self, params: &ActionParams) -> Result<()> {
        ActionArguments::parse(self.kind(), params).map(|_| ())
    }

    /// 对一批实体执行动作
    async fn apply(&self, urns: &[Urn], params: &ActionParams) -> Result<()>;
}

/// 解析后的动作参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionArguments {
    /// 要添加或移除的标签、术语、域或所有者
    pub values: Vec<Urn>,
    /// ADD_OWNERS 的所有权类型
    pub ownership_type: String,
}

impl ActionArguments {
    /// 除 UNSET_DOMAIN 外都需要 `values`；SET_DOMAIN 只能指定一个域
    pub fn parse(kind: ActionKind, params: &ActionParams) -> Result<Self> {
        let fail = |message: String| TestEngineError::Action {
            kind: kind.to_string(),
            message,
        };

        let values = match (kind, params.get(VALUES_PARAM)) {
            (ActionKind::UnsetDomain, _) => Vec::new(),
            (_, None) => return Err(fail(format!("缺少必填参数 '{}'", VALUES_PARAM))),
            (_, Some(raw)) if raw.is_empty() => {
                return Err(fail(format!("参数 '{}' 不能为空", VALUES_PARAM)));
            }
            (_, Some(raw)) => raw
                .iter()
                .map(|value| Urn::parse(value.as_str()).map_err(|_| fail(format!("'{}' 不是合法的 URN", value))))
                .collect::<Result<Vec<_>>>()?,
        };

        if kind == ActionKind::SetDomain && values.len() != 1 {
            return Err(fail(format!("只能指定一个域，实际为 {} 个", values.len())));
        }
        if let Some(expected) = expected_value_types(kind) {
            if let Some(urn) = values.iter().find(|urn| !expected.contains(&urn.entity_type())) {
                return Err(fail(format!(
                    "'{}' 的实体类型不是 {}",
                    urn,
                    expected.join("/")
                )));
            }
        }

        let ownership_type = match params.get(OWNERSHIP_TYPE_PARAM).map(Vec::as_slice) {
            Some([single]) => single.clone(),
            _ => DEFAULT_OWNERSHIP_TYPE.to_string(),
        };

        Ok(Self {
            values,
            ownership_type,
        })
    }
}

/// 各动作 `values` 中允许的实体类型
fn expected_value_types(kind: ActionKind) -> Option<&'static [&'static str]> {
    match kind {
        ActionKind::AddTags | ActionKind::RemoveTags => Some(&["tag"]),
        ActionKind::AddGlossaryTerms | ActionKind::RemoveGlossaryTerms => Some(&["glossaryTerm"]),
        ActionKind::SetDomain | ActionKind::AddDomains | ActionKind::RemoveDomains => Some(&["domain"]),
        ActionKind::AddOwners | ActionKind::RemoveOwners => Some(&["corpuser", "corpGroup"]),
        ActionKind::UnsetDomain => None,
    }
}

/// 动作处理器注册表
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同类型已存在时替换
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> &mut Self {
        let kind = handler.kind();
        debug!(kind = %kind, "注册动作处理器");
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<ActionKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn handler(&self, kind: ActionKind) -> Result<Arc<dyn ActionHandler>> {
        self.get(kind).ok_or_else(|| TestEngineError::Action {
            kind: kind.to_string(),
            message: "未注册该动作类型的处理器".to_string(),
        })
    }
}

#[async_trait]
impl ActionApplier for ActionRegistry {
    async fn apply_action(&self, kind: ActionKind, urns: &[Urn], params: &ActionParams) -> Result<()> {
        let handler = self.handler(kind)?;
        handler.validate(params)?;
        if urns.is_empty() {
            return Ok(());
        }
        handler.apply(urns, params).await
    }

    fn validate_params(&self, kind: ActionKind, params: &ActionParams) -> Result<()> {
        self.handler(kind)?.validate(params)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn params(entries: &[(&str, &[&str])]) -> ActionParams {
        entries
            .iter()
            .map(|(name, values)| (name.to_string(), values.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<Vec<Urn>>>,
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        fn kind(&self) -> ActionKind {
            ActionKind::AddTags
        }

        async fn apply(&self, urns: &[Urn], _params: &ActionParams) -> Result<()> {
            self.calls.lock().push(urns.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_parse_arguments() {
        let args = ActionArguments::parse(
            ActionKind::AddOwners,
            &params(&[("values", &["urn:li:corpuser:jdoe"]), ("type", &["TECHNICAL_OWNER"])]),
        )
        .unwrap();
        assert_eq!(args.values.len(), 1);
        assert_eq!(args.ownership_type, "TECHNICAL_OWNER");

        let args = ActionArguments::parse(ActionKind::RemoveOwners, &params(&[("values", &["urn:li:corpGroup:eng"])])).unwrap();
        assert_eq!(args.ownership_type, DEFAULT_OWNERSHIP_TYPE);

        let args = ActionArguments::parse(ActionKind::UnsetDomain, &ActionParams::new()).unwrap();
        assert!(args.values.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_params() {
        let cases = [
            (ActionKind::AddTags, params(&[])),
            (ActionKind::AddTags, params(&[("values", &[])])),
            (ActionKind::AddTags, params(&[("values", &["pii"])])),
            (ActionKind::AddTags, params(&[("values", &["urn:li:glossaryTerm:pii"])])),
            (
                ActionKind::SetDomain,
                params(&[("values", &["urn:li:domain:a", "urn:li:domain:b"])]),
            ),
        ];
        for (kind, params) in cases {
            let err = ActionArguments::parse(kind, &params).unwrap_err();
            assert!(matches!(err, TestEngineError::Action { .. }), "{kind}: {err}");
        }
    }

    #[tokio::test]
    async fn test_registry_routes_and_validates() {
        let handler = Arc::new(RecordingHandler::default());
        let mut registry = ActionRegistry::new();
        registry.register(handler.clone());
        assert_eq!(registry.kinds(), vec![ActionKind::AddTags]);

        let urns = vec![Urn::parse("urn:li:dataset:a").unwrap()];
        registry
            .apply_action(ActionKind::AddTags, &urns, &params(&[("values", &["urn:li:tag:pii"])]))
            .await
            .unwrap();
        assert_eq!(handler.calls.lock().len(), 1);

        // 参数不合法时不会调用处理器
        assert!(registry.apply_action(ActionKind::AddTags, &urns, &params(&[])).await.is_err());
        assert_eq!(handler.calls.lock().len(), 1);

        let err = registry
            .apply_action(ActionKind::SetDomain, &urns, &params(&[("values", &["urn:li:domain:a"])]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SET_DOMAIN"));
        assert!(registry.validate_params(ActionKind::RemoveTags, &ActionParams::new()).is_err());
    }
}
