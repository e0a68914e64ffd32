//! 测试定义解析器
//!
//! 将 JSON 规则文档解析为表达式 AST，并通过操作符评估器校验操作数。
//!
//! 规则节点的三种形态：
//! - 数组：隐式 AND
//! - 含 `not` / `or` / `and` 之一的对象：逻辑节点
//! - 含 `property` 与 `operator` 的对象：叶子节点，`params` 或其余键作为具名操作数
//!
//! 旧字段名通过 [`FIELD_ALIASES`] 在读取对象时统一归一，`negate: true` 等价于外层包一个 NOT。

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value, json};
use tracing::instrument;

use crate::error::{Result, TestEngineError};
use crate::evaluator::OperatorEvaluator;
use crate::models::{
    ActionKind, ActionParams, Expression, Operand, PROPERTY_OPERAND, Predicate, PropertyRef,
    TestAction, TestActions, TestDefinition, TestMatch,
};
use crate::operators::Operator;

/// 旧字段名 -> 规范字段名
pub const FIELD_ALIASES: &[(&str, &str)] = &[
    ("operation", "operator"),
    ("query", "property"),
    ("match", "conditions"),
];

const NEGATE_FIELD: &str = "negate";
const PARAMS_FIELD: &str = "params";
const NOT_FIELD: &str = "not";
const LOGICAL_FIELDS: [(&str, Operator); 3] = [
    (NOT_FIELD, Operator::Not),
    ("or", Operator::Or),
    ("and", Operator::And),
];
/// 叶子节点中不作为操作数的字段
const RESERVED_LEAF_FIELDS: [&str; 4] = ["property", "operator", NEGATE_FIELD, PARAMS_FIELD];

fn parse_error(message: String) -> TestEngineError {
    TestEngineError::Parse(message)
}

fn canonical_field(key: &str) -> &str {
    FIELD_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(key)
}

/// 键名归一化；规范名与旧名同时出现时以规范名为准
fn normalize(object: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::new();
    for (key, value) in object {
        let canonical = canonical_field(key);
        if canonical != key && object.contains_key(canonical) {
            continue;
        }
        normalized.insert(canonical.to_string(), value.clone());
    }
    normalized
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 测试定义解析器
#[derive(Debug, Clone, Default)]
pub struct TestDefinitionParser;

impl TestDefinitionParser {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 文本解析测试定义
    #[instrument(skip(self, json))]
    pub fn parse(&self, id: &str, json: &str) -> Result<TestDefinition> {
        let document: Value = serde_json::from_str(json)
            .map_err(|e| parse_error(format!("测试 '{}' 不是合法的 JSON: {}", id, e)))?;
        self.parse_value(id, &document)
    }

    /// 从已解析的 JSON 值构造测试定义
    pub fn parse_value(&self, id: &str, document: &Value) -> Result<TestDefinition> {
        let root = document
            .as_object()
            .ok_or_else(|| parse_error(format!("测试 '{}' 的定义必须是 JSON 对象", id)))?;

        let on = root
            .get("on")
            .ok_or_else(|| parse_error(format!("测试 '{}' 缺少 on 块", id)))?;
        let targeting = self.parse_match(on)?;

        let rules = root
            .get("rules")
            .ok_or_else(|| parse_error(format!("测试 '{}' 缺少 rules 块", id)))?;
        let rules = self.parse_rule(rules, "rules")?;

        let actions = match root.get("actions") {
            None | Some(Value::Null) => TestActions::default(),
            Some(actions) => self.parse_actions(actions)?,
        };

        Ok(TestDefinition {
            id: id.to_string(),
            targeting,
            rules,
            actions,
        })
    }

    fn parse_match(&self, on: &Value) -> Result<TestMatch> {
        let object = normalize(
            on.as_object()
                .ok_or_else(|| parse_error("on 块必须是对象".to_string()))?,
        );

        let types = object
            .get("types")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error("on 块缺少 types 数组".to_string()))?;
        let entity_types = types
            .iter()
            .enumerate()
            .map(|(i, t)| {
                scalar_text(t).ok_or_else(|| parse_error(format!("on.types[{}] 必须是字符串", i)))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        let conditions = match object.get("conditions") {
            None | Some(Value::Null) => None,
            Some(node) => Some(self.parse_rule(node, "on.conditions")?),
        };

        Ok(TestMatch {
            entity_types,
            conditions,
        })
    }

    /// 解析规则节点
    fn parse_rule(&self, node: &Value, path: &str) -> Result<Predicate> {
        match node {
            Value::Array(children) => self.parse_composite(Operator::And, children, path),
            Value::Object(raw) => {
                let object = normalize(raw);
                let negate = match object.get(NEGATE_FIELD) {
                    // 显式的 not 优先，negate 被忽略
                    _ if object.contains_key(NOT_FIELD) => false,
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(flag)) => *flag,
                    Some(_) => {
                        return Err(parse_error(format!("'{}.negate' 必须是布尔值", path)));
                    }
                };
                let predicate = self.parse_object(&object, path)?;
                Ok(if negate { predicate.negate() } else { predicate })
            }
            _ => Err(parse_error(format!("规则节点 '{}' 必须是对象或数组", path))),
        }
    }

    fn parse_object(&self, object: &Map<String, Value>, path: &str) -> Result<Predicate> {
        let logical: Vec<(&str, Operator)> = LOGICAL_FIELDS
            .into_iter()
            .filter(|(key, _)| object.contains_key(*key))
            .collect();

        match logical.as_slice() {
            [] => self.parse_leaf(object, path),
            [(key, Operator::Not)] => {
                let child_path = format!("{}.{}", path, key);
                let child = self.parse_rule(&object[*key], &child_path)?;
                Ok(Predicate::not(child))
            }
            [(key, operator)] => {
                let child_path = format!("{}.{}", path, key);
                let children = object[*key].as_array().ok_or_else(|| {
                    parse_error(format!("逻辑节点 '{}' 必须是数组", child_path))
                })?;
                self.parse_composite(*operator, children, &child_path)
            }
            _ => Err(parse_error(format!(
                "规则节点 '{}' 只能包含 not/or/and 中的一个",
                path
            ))),
        }
    }

    fn parse_composite(&self, operator: Operator, children: &[Value], path: &str) -> Result<Predicate> {
        let children = children
            .iter()
            .enumerate()
            .map(|(i, child)| self.parse_rule(child, &format!("{}[{}]", path, i)))
            .collect::<Result<Vec<_>>>()?;
        let predicate = Predicate::compose(operator, children);
        self.validate(&predicate, path)?;
        Ok(predicate)
    }

    fn parse_leaf(&self, object: &Map<String, Value>, path: &str) -> Result<Predicate> {
        let property = object
            .get("property")
            .ok_or_else(|| parse_error(format!("叶子节点 '{}' 缺少 property 字段", path)))?
            .as_str()
            .ok_or_else(|| parse_error(format!("叶子节点 '{}' 的 property 必须是字符串", path)))?;
        if property.is_empty() {
            return Err(parse_error(format!("叶子节点 '{}' 的 property 不能为空", path)));
        }

        let operator_name = object
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| parse_error(format!("叶子节点 '{}' 缺少 operator 字段", path)))?;
        let operator = Operator::from_name(operator_name).ok_or_else(|| {
            parse_error(format!(
                "叶子节点 '{}' 使用了无法识别的操作符 '{}'",
                path, operator_name
            ))
        })?;

        let params: Vec<(&String, &Value)> = match object.get(PARAMS_FIELD) {
            Some(Value::Object(params)) => params.iter().collect(),
            Some(_) => {
                return Err(parse_error(format!("'{}.params' 必须是对象", path)));
            }
            None => object
                .iter()
                .filter(|(key, _)| !RESERVED_LEAF_FIELDS.contains(&key.as_str()))
                .collect(),
        };

        let mut operands = vec![Operand::new(
            0,
            Some(PROPERTY_OPERAND),
            Expression::Property(PropertyRef::new(property)),
        )];
        for (name, value) in params {
            let values = self.string_list(value, &format!("{}.{}", path, name))?;
            let index = operands.len();
            operands.push(Operand::new(index, Some(name), Expression::StringList(values)));
        }

        let predicate = Predicate::new(operator, operands);
        self.validate(&predicate, path)?;
        Ok(predicate)
    }

    fn validate(&self, predicate: &Predicate, path: &str) -> Result<()> {
        OperatorEvaluator::validate(predicate.operator, &predicate.operands)
            .map_err(|e| parse_error(format!("规则节点 '{}' 校验失败: {}", path, e)))
    }

    fn string_list(&self, value: &Value, path: &str) -> Result<Vec<String>> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    scalar_text(item).ok_or_else(|| {
                        parse_error(format!("'{}[{}]' 必须是字符串、数字或布尔值", path, i))
                    })
                })
                .collect(),
            other => scalar_text(other)
                .map(|text| vec![text])
                .ok_or_else(|| parse_error(format!("'{}' 必须是字符串或字符串数组", path))),
        }
    }

    fn parse_actions(&self, node: &Value) -> Result<TestActions> {
        let object = node
            .as_object()
            .ok_or_else(|| parse_error("actions 必须是对象".to_string()))?;
        Ok(TestActions {
            passing: self.parse_action_list(object.get("passing"), "actions.passing")?,
            failing: self.parse_action_list(object.get("failing"), "actions.failing")?,
        })
    }

    fn parse_action_list(&self, node: Option<&Value>, path: &str) -> Result<Vec<TestAction>> {
        match node {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.parse_action(item, &format!("{}[{}]", path, i)))
                .collect(),
            Some(_) => Err(parse_error(format!("'{}' 必须是数组", path))),
        }
    }

    fn parse_action(&self, node: &Value, path: &str) -> Result<TestAction> {
        let object = node
            .as_object()
            .ok_or_else(|| parse_error(format!("动作 '{}' 必须是对象", path)))?;

        let type_name = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| parse_error(format!("动作 '{}' 缺少 type 字段", path)))?;
        let kind = ActionKind::from_name(type_name).ok_or_else(|| {
            parse_error(format!("动作 '{}' 的类型 '{}' 不受支持", path, type_name))
        })?;

        let entries: Vec<(&String, &Value)> = match object.get(PARAMS_FIELD) {
            Some(Value::Object(params)) => params.iter().collect(),
            Some(_) => {
                return Err(parse_error(format!("'{}.params' 必须是对象", path)));
            }
            None => object.iter().filter(|(key, _)| key.as_str() != "type").collect(),
        };

        let mut params = ActionParams::new();
        for (name, value) in entries {
            let values = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        parse_error(format!("动作参数 '{}.{}' 只能包含字符串", path, name))
                    })?,
                _ => {
                    return Err(parse_error(format!(
                        "动作参数 '{}.{}' 必须是字符串或字符串数组",
                        path, name
                    )));
                }
            };
            params.insert(name.clone(), values);
        }

        Ok(TestAction { kind, params })
    }
}

// ==================== 规范化序列化 ====================

/// 将测试定义序列化为规范 JSON 形式
///
/// 重新解析输出得到的 AST 与原定义求值行为一致。
pub fn to_canonical_json(definition: &TestDefinition) -> Value {
    let mut on = Map::new();
    on.insert(
        "types".to_string(),
        Value::from(definition.targeting.entity_types.iter().cloned().collect::<Vec<_>>()),
    );
    if let Some(conditions) = &definition.targeting.conditions {
        on.insert("conditions".to_string(), predicate_to_json(conditions));
    }

    json!({
        "on": on,
        "rules": predicate_to_json(&definition.rules),
        "actions": {
            "passing": definition.actions.passing.iter().map(action_to_json).collect::<Vec<_>>(),
            "failing": definition.actions.failing.iter().map(action_to_json).collect::<Vec<_>>(),
        }
    })
}

fn predicate_to_json(predicate: &Predicate) -> Value {
    let node = if predicate.operator.is_logical() {
        let children: Vec<Value> = predicate
            .operands
            .iter()
            .map(|operand| expression_to_json(&operand.expression))
            .collect();
        match predicate.operator {
            Operator::Not => json!({ "not": children.into_iter().next().unwrap_or(Value::Null) }),
            operator => json!({ operator.common_name(): children }),
        }
    } else {
        let mut leaf = Map::new();
        let mut params = Map::new();
        for operand in &predicate.operands {
            match &operand.expression {
                Expression::Property(reference) if operand.index == 0 => {
                    leaf.insert("property".to_string(), Value::from(reference.path()));
                }
                expression => {
                    let name = operand
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("operand{}", operand.index));
                    params.insert(name, expression_to_json(expression));
                }
            }
        }
        leaf.insert(
            "operator".to_string(),
            Value::from(predicate.operator.common_name()),
        );
        if !params.is_empty() {
            leaf.insert(PARAMS_FIELD.to_string(), Value::Object(params));
        }
        Value::Object(leaf)
    };

    if predicate.negated {
        json!({ "not": node })
    } else {
        node
    }
}

fn expression_to_json(expression: &Expression) -> Value {
    match expression {
        Expression::Property(reference) => Value::from(reference.path()),
        Expression::StringList(values) => Value::from(values.clone()),
        Expression::Predicate(predicate) => predicate_to_json(predicate),
    }
}

fn action_to_json(action: &TestAction) -> Value {
    let params: BTreeMap<&str, &Vec<String>> = action
        .params
        .iter()
        .map(|(name, values)| (name.as_str(), values))
        .collect();
    json!({ "type": action.kind.as_str(), "params": params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PropertyRef, VALUES_OPERAND};
    use crate::predicate::{PredicateEvaluator, ResolvedValues};

    fn parse(json: &str) -> Result<TestDefinition> {
        TestDefinitionParser::new().parse("urn:li:test:test", json)
    }

    #[test]
    fn test_parse_full_definition() {
        let definition = parse(
            r#"{
                "on": {
                    "types": ["dataset", "chart"],
                    "conditions": {"property": "dataPlatformInstance.platform", "operator": "equals", "values": ["urn:li:dataPlatform:bigQuery"]}
                },
                "rules": {
                    "or": [
                        {"property": "glossaryTerms.terms.urn", "operator": "contains_any", "values": ["urn:li:glossaryTerm:term1"]},
                        {"property": "ownership.owners.owner", "operator": "exists"}
                    ]
                },
                "actions": {
                    "passing": [{"type": "add_tags", "params": {"values": ["urn:li:tag:passing"]}}],
                    "failing": [{"type": "SET_DOMAIN", "values": "urn:li:domain:review"}]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(definition.id, "urn:li:test:test");
        assert!(definition.targeting.matches_type("dataset"));
        assert!(definition.targeting.matches_type("chart"));
        assert!(definition.targeting.conditions.is_some());
        assert_eq!(definition.rules.operator, Operator::Or);
        assert_eq!(definition.rules.children().count(), 2);
        assert_eq!(definition.actions.passing[0].kind, ActionKind::AddTags);
        assert_eq!(
            definition.actions.failing[0].params.get("values"),
            Some(&vec!["urn:li:domain:review".to_string()])
        );
    }

    #[test]
    fn test_bare_array_is_implicit_and() {
        let definition = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": [
                {"property": "a", "operator": "exists"},
                {"property": "b", "operator": "is_true"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(definition.rules.operator, Operator::And);
        assert_eq!(definition.rules.operands.len(), 2);
    }

    #[test]
    fn test_legacy_aliases_map_to_same_ast() {
        let modern = parse(
            r#"{"on": {"types": ["dataset"], "conditions": {"property": "x", "operator": "exists"}},
                "rules": {"property": "p", "operator": "equals", "values": ["v"]}}"#,
        )
        .unwrap();
        let legacy = parse(
            r#"{"on": {"types": ["dataset"], "match": {"query": "x", "operation": "exists"}},
                "rules": {"query": "p", "operation": "equals", "values": ["v"]}}"#,
        )
        .unwrap();
        assert_eq!(modern, legacy);
    }

    #[test]
    fn test_negate_and_not_wrappers() {
        let negated = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"property": "p", "operator": "exists", "negate": true}}"#,
        )
        .unwrap();
        assert!(negated.rules.negated);
        assert_eq!(negated.rules.operands.len(), 1);

        let not = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"not": {"property": "p", "operator": "exists"}}}"#,
        )
        .unwrap();
        assert_eq!(not.rules.operator, Operator::Not);
        assert!(!not.rules.negated);
    }

    #[test]
    fn test_not_takes_precedence_over_negate() {
        let definition = parse(
            r#"{"on": {"types": ["dataset"]},
                "rules": {"not": {"property": "a", "operator": "exists"}, "negate": true}}"#,
        )
        .unwrap();
        assert_eq!(definition.rules.operator, Operator::Not);
        assert!(!definition.rules.negated);

        let mut present = ResolvedValues::new();
        present.insert(PropertyRef::new("a"), vec!["x".to_string()]);
        assert!(!PredicateEvaluator::evaluate(&definition.rules, &present).unwrap());
        assert!(PredicateEvaluator::evaluate(&definition.rules, &ResolvedValues::new()).unwrap());
    }

    #[test]
    fn test_params_and_implicit_operands() {
        let explicit = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"property": "p", "operator": "greater_than", "params": {"value": 5}}}"#,
        )
        .unwrap();
        let operand = &explicit.rules.operands[1];
        assert_eq!(operand.name.as_deref(), Some("value"));
        assert_eq!(operand.expression, Expression::StringList(vec!["5".to_string()]));

        let implicit = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"property": "p", "operator": "starts_with", "values": ["a", "b"]}}"#,
        )
        .unwrap();
        assert_eq!(implicit.rules.operands[1].name.as_deref(), Some(VALUES_OPERAND));
    }

    #[test]
    fn test_missing_blocks_are_rejected() {
        let cases = [
            ("not json", "不是合法的 JSON"),
            (r#"{"rules": []}"#, "缺少 on 块"),
            (r#"{"on": {"types": ["dataset"]}}"#, "缺少 rules 块"),
            (r#"{"on": {}, "rules": {"property": "p", "operator": "exists"}}"#, "types"),
        ];
        for (json, expected) in cases {
            let err = parse(json).unwrap_err();
            assert!(matches!(err, TestEngineError::Parse(_)));
            assert!(err.to_string().contains(expected), "{json}: {err}");
        }
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let err = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"property": "p", "operator": "between", "values": ["1"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("between"));
    }

    #[test]
    fn test_operand_validation_is_surfaced_as_parse_error() {
        let err = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": {"property": "p", "operator": "equals"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TestEngineError::Parse(_)));
        assert!(err.to_string().contains("ANY_EQUALS"));

        let err = parse(r#"{"on": {"types": ["dataset"]}, "rules": {"or": {"property": "p"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("必须是数组"));

        let err = parse(r#"{"on": {"types": ["dataset"]}, "rules": {"and": [], "or": []}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("只能包含"));
    }

    #[test]
    fn test_invalid_action_params() {
        let err = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": [{"property": "p", "operator": "exists"}],
                "actions": {"passing": [{"type": "add_tags", "params": {"values": [1, 2]}}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("只能包含字符串"));

        let err = parse(
            r#"{"on": {"types": ["dataset"]}, "rules": [{"property": "p", "operator": "exists"}],
                "actions": {"passing": [{"type": "launch_rocket"}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("launch_rocket"));
    }

    #[test]
    fn test_canonical_form_reparses_to_equivalent_definition() {
        let original = parse(
            r#"{"on": {"types": ["dataset"], "match": {"query": "x", "operation": "exists"}},
                "rules": [
                    {"query": "p", "operation": "equals", "values": ["v1", "v2"], "negate": true},
                    {"not": {"or": [{"property": "n", "operator": "greater_than", "value": "5"}]}}
                ],
                "actions": {"failing": [{"type": "add_tags", "values": ["urn:li:tag:t"]}]}}"#,
        )
        .unwrap();

        let canonical = to_canonical_json(&original);
        let reparsed = TestDefinitionParser::new()
            .parse_value("urn:li:test:test", &canonical)
            .unwrap();

        assert_eq!(reparsed.targeting, original.targeting);
        assert_eq!(reparsed.actions, original.actions);
        // 再次序列化结果稳定
        assert_eq!(to_canonical_json(&reparsed), canonical);
    }
}
