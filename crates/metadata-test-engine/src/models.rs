//! 数据模型
//!
//! 包含规则语言的表达式 AST、测试定义、测试结果以及实体切面的数据结构。
//! AST 节点均为不可变值类型，刷新时整体替换而不是原地修改。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operators::{Operator, ValueType};
use crate::urn::Urn;

// ==================== 表达式 AST ====================

/// 属性引用：点分隔的属性路径，如 `glossaryTerms.terms.urn`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyRef(String);

impl PropertyRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyRef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// 表达式
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// 属性引用，求值时替换为解析出的值集合
    Property(PropertyRef),
    /// 字符串列表字面量
    StringList(Vec<String>),
    /// 嵌套谓词（逻辑操作符的操作数）
    Predicate(Box<Predicate>),
}

impl Expression {
    pub fn value_type(&self) -> ValueType {
        match self {
            Expression::Property(_) | Expression::StringList(_) => ValueType::StringList,
            Expression::Predicate(_) => ValueType::Boolean,
        }
    }
}

/// 操作数
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    /// 在操作数列表中的位置
    pub index: usize,
    pub name: Option<String>,
    pub expression: Expression,
}

impl Operand {
    pub fn new(index: usize, name: Option<&str>, expression: Expression) -> Self {
        Self {
            index,
            name: name.map(str::to_string),
            expression,
        }
    }
}

/// 属性操作数的名称
pub const PROPERTY_OPERAND: &str = "property";
/// 字面量操作数的默认名称
pub const VALUES_OPERAND: &str = "values";

/// 谓词节点
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub operator: Operator,
    pub operands: Vec<Operand>,
    /// 为 true 时对操作符结果取反
    pub negated: bool,
}

impl Predicate {
    pub fn new(operator: Operator, operands: Vec<Operand>) -> Self {
        Self {
            operator,
            operands,
            negated: false,
        }
    }

    /// 以子谓词为操作数构造逻辑节点
    pub fn compose(operator: Operator, children: Vec<Predicate>) -> Self {
        let operands = children
            .into_iter()
            .enumerate()
            .map(|(index, child)| Operand::new(index, None, Expression::Predicate(Box::new(child))))
            .collect();
        Self::new(operator, operands)
    }

    pub fn and(children: Vec<Predicate>) -> Self {
        Self::compose(Operator::And, children)
    }

    pub fn or(children: Vec<Predicate>) -> Self {
        Self::compose(Operator::Or, children)
    }

    pub fn not(child: Predicate) -> Self {
        Self::compose(Operator::Not, vec![child])
    }

    /// 只引用一个属性的叶子节点（EXISTS / IS_TRUE / IS_FALSE）
    pub fn property(operator: Operator, path: &str) -> Self {
        Self::new(
            operator,
            vec![Operand::new(
                0,
                Some(PROPERTY_OPERAND),
                Expression::Property(PropertyRef::new(path)),
            )],
        )
    }

    /// 属性与字符串列表比较的叶子节点
    pub fn compare(operator: Operator, path: &str, values: &[&str]) -> Self {
        let mut predicate = Self::property(operator, path);
        predicate.operands.push(Operand::new(
            1,
            Some(VALUES_OPERAND),
            Expression::StringList(values.iter().map(|v| v.to_string()).collect()),
        ));
        predicate
    }

    /// 翻转取反标记
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// 直接子谓词
    pub fn children(&self) -> impl Iterator<Item = &Predicate> {
        self.operands.iter().filter_map(|operand| match &operand.expression {
            Expression::Predicate(child) => Some(child.as_ref()),
            _ => None,
        })
    }
}

// ==================== 测试定义 ====================

/// 测试的作用范围
#[derive(Debug, Clone, PartialEq)]
pub struct TestMatch {
    pub entity_types: BTreeSet<String>,
    /// 二次筛选条件，为空时对所有匹配类型的实体生效
    pub conditions: Option<Predicate>,
}

impl TestMatch {
    pub fn matches_type(&self, entity_type: &str) -> bool {
        self.entity_types.contains(entity_type)
    }
}

/// 动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    AddTags,
    RemoveTags,
    AddGlossaryTerms,
    RemoveGlossaryTerms,
    SetDomain,
    UnsetDomain,
    AddDomains,
    RemoveDomains,
    AddOwners,
    RemoveOwners,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::AddTags,
        ActionKind::RemoveTags,
        ActionKind::AddGlossaryTerms,
        ActionKind::RemoveGlossaryTerms,
        ActionKind::SetDomain,
        ActionKind::UnsetDomain,
        ActionKind::AddDomains,
        ActionKind::RemoveDomains,
        ActionKind::AddOwners,
        ActionKind::RemoveOwners,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AddTags => "ADD_TAGS",
            ActionKind::RemoveTags => "REMOVE_TAGS",
            ActionKind::AddGlossaryTerms => "ADD_GLOSSARY_TERMS",
            ActionKind::RemoveGlossaryTerms => "REMOVE_GLOSSARY_TERMS",
            ActionKind::SetDomain => "SET_DOMAIN",
            ActionKind::UnsetDomain => "UNSET_DOMAIN",
            ActionKind::AddDomains => "ADD_DOMAINS",
            ActionKind::RemoveDomains => "REMOVE_DOMAINS",
            ActionKind::AddOwners => "ADD_OWNERS",
            ActionKind::RemoveOwners => "REMOVE_OWNERS",
        }
    }

    /// 大小写不敏感的名称查找
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 动作参数：参数名 -> 字符串列表
pub type ActionParams = BTreeMap<String, Vec<String>>;

/// 通过或失败时触发的动作
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestAction {
    pub kind: ActionKind,
    pub params: ActionParams,
}

/// 测试的动作配置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestActions {
    pub passing: Vec<TestAction>,
    pub failing: Vec<TestAction>,
}

impl TestActions {
    pub fn for_verdict(&self, verdict: Verdict) -> &[TestAction] {
        match verdict {
            Verdict::Success => &self.passing,
            Verdict::Failure => &self.failing,
        }
    }
}

/// 解析后的测试定义
#[derive(Debug, Clone, PartialEq)]
pub struct TestDefinition {
    pub id: String,
    pub targeting: TestMatch,
    pub rules: Predicate,
    pub actions: TestActions,
}

/// 规则存储中的原始定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTestDefinition {
    pub id: String,
    /// JSON 文本
    pub definition: String,
}

/// 分页拉取的一页定义
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionPage {
    pub items: Vec<RawTestDefinition>,
    pub total: usize,
}

// ==================== 测试结果 ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Failure,
}

/// 单个测试对单个实体的结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(rename = "test")]
    pub test_id: String,
    #[serde(rename = "type")]
    pub verdict: Verdict,
}

/// 实体的测试结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    #[serde(default)]
    pub passing: Vec<TestOutcome>,
    #[serde(default)]
    pub failing: Vec<TestOutcome>,
}

impl TestResults {
    pub fn record(&mut self, test_id: &str, passed: bool) {
        if passed {
            self.passing.push(TestOutcome {
                test_id: test_id.to_string(),
                verdict: Verdict::Success,
            });
        } else {
            self.failing.push(TestOutcome {
                test_id: test_id.to_string(),
                verdict: Verdict::Failure,
            });
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.passing.iter().chain(self.failing.iter())
    }

    pub fn len(&self) -> usize {
        self.passing.len() + self.failing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passing.is_empty() && self.failing.is_empty()
    }

    /// 与已存储的结果合并：本次评估过的测试以新结果为准，其余沿用旧结果
    pub fn merge_with_prior(mut self, prior: TestResults, evaluated: &HashSet<String>) -> Self {
        self.passing.extend(
            prior
                .passing
                .into_iter()
                .filter(|outcome| !evaluated.contains(&outcome.test_id)),
        );
        self.failing.extend(
            prior
                .failing
                .into_iter()
                .filter(|outcome| !evaluated.contains(&outcome.test_id)),
        );
        self
    }
}

/// 静态校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub messages: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            messages: Vec::new(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            messages: vec![message.into()],
        }
    }

    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.valid &= other.valid;
        self.messages.extend(other.messages);
        self
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

// ==================== 实体切面 ====================

/// 审计时间戳
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    /// epoch 毫秒
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// 切面的系统元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<i64>,
}

/// 带版本信封的切面
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopedAspect {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<AuditStamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metadata: Option<SystemMetadata>,
}

impl EnvelopedAspect {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            created: None,
            system_metadata: None,
        }
    }

    pub fn with_created(mut self, time: i64) -> Self {
        self.created = Some(AuditStamp { time, actor: None });
        self
    }

    pub fn with_system_metadata(mut self, run_id: Option<&str>, last_observed: i64) -> Self {
        self.system_metadata = Some(SystemMetadata {
            run_id: run_id.map(str::to_string),
            last_observed: Some(last_observed),
        });
        self
    }
}

/// 一个实体的切面集合：切面名 -> 切面
pub type EntityAspects = HashMap<String, EnvelopedAspect>;

/// 实体检索的一页结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrollPage {
    pub urns: Vec<Urn>,
    /// 为空表示已到末尾
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_ref_segments() {
        let reference = PropertyRef::new("glossaryTerms.terms.urn");
        assert_eq!(
            reference.segments().collect::<Vec<_>>(),
            vec!["glossaryTerms", "terms", "urn"]
        );
    }

    #[test]
    fn test_compare_builder_positions() {
        let predicate = Predicate::compare(Operator::AnyEquals, "p", &["v1", "v2"]);
        assert_eq!(predicate.operands.len(), 2);
        assert_eq!(predicate.operands[0].index, 0);
        assert_eq!(predicate.operands[1].name.as_deref(), Some(VALUES_OPERAND));
        assert_eq!(predicate.operands[1].expression.value_type(), ValueType::StringList);
    }

    #[test]
    fn test_negate_toggles() {
        let predicate = Predicate::property(Operator::Exists, "p");
        assert!(predicate.clone().negate().negated);
        assert!(!predicate.negate().negate().negated);
    }

    #[test]
    fn test_action_kind_lookup() {
        assert_eq!(ActionKind::from_name("add_tags"), Some(ActionKind::AddTags));
        assert_eq!(ActionKind::from_name("Set_Domain"), Some(ActionKind::SetDomain));
        assert_eq!(ActionKind::from_name("raise_incident"), None);
    }

    #[test]
    fn test_results_merge_replaces_evaluated_tests() {
        let mut prior = TestResults::default();
        prior.record("test-a", true);
        prior.record("test-b", false);
        prior.record("test-c", true);

        let mut current = TestResults::default();
        current.record("test-a", false);

        let evaluated: HashSet<String> = ["test-a".to_string()].into_iter().collect();
        let merged = current.merge_with_prior(prior, &evaluated);

        let passing: Vec<_> = merged.passing.iter().map(|o| o.test_id.as_str()).collect();
        let failing: Vec<_> = merged.failing.iter().map(|o| o.test_id.as_str()).collect();
        assert_eq!(passing, vec!["test-c"]);
        assert_eq!(failing, vec!["test-a", "test-b"]);
    }

    #[test]
    fn test_results_serialized_shape() {
        let mut results = TestResults::default();
        results.record("urn:li:test:1", true);
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "passing": [{"test": "urn:li:test:1", "type": "SUCCESS"}],
                "failing": []
            })
        );
    }

    #[test]
    fn test_validation_result_merge() {
        let merged = ValidationResult::valid()
            .merge(ValidationResult::invalid("a"))
            .merge(ValidationResult::invalid("b"));
        assert!(!merged.valid);
        assert_eq!(merged.messages, vec!["a", "b"]);
    }
}
