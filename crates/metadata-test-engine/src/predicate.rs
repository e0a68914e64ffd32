//! 谓词求值
//!
//! 以预先解析好的属性值为输入，对谓词树自底向上求值。

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::evaluator::{OperatorEvaluator, ResolvedOperand};
use crate::models::{Expression, Predicate, PropertyRef};

/// 单个实体的属性值：属性引用 -> 值集合
pub type ResolvedValues = HashMap<PropertyRef, Vec<String>>;

/// 谓词求值器
pub struct PredicateEvaluator;

impl PredicateEvaluator {
    /// 求值；缺失的属性视为空集合，`negated` 对操作符结果取反
    pub fn evaluate(predicate: &Predicate, values: &ResolvedValues) -> Result<bool> {
        let mut nested = Vec::new();
        for operand in &predicate.operands {
            if let Expression::Predicate(child) = &operand.expression {
                nested.push(Self::evaluate(child, values)?);
            }
        }

        let mut nested = nested.into_iter();
        let resolved: Vec<ResolvedOperand<'_>> = predicate
            .operands
            .iter()
            .map(|operand| match &operand.expression {
                Expression::Property(reference) => ResolvedOperand::Values(
                    values.get(reference).map(Vec::as_slice).unwrap_or(&[]),
                ),
                Expression::StringList(list) => ResolvedOperand::Values(list),
                Expression::Predicate(_) => {
                    ResolvedOperand::Boolean(nested.next().unwrap_or_default())
                }
            })
            .collect();

        let result = OperatorEvaluator::evaluate(predicate.operator, &resolved)?;
        Ok(result != predicate.negated)
    }

    /// 收集谓词树中引用的全部属性
    pub fn extract_references(predicate: &Predicate) -> HashSet<PropertyRef> {
        let mut references = HashSet::new();
        Self::collect(predicate, &mut references);
        references
    }

    fn collect(predicate: &Predicate, references: &mut HashSet<PropertyRef>) {
        for operand in &predicate.operands {
            match &operand.expression {
                Expression::Property(reference) => {
                    references.insert(reference.clone());
                }
                Expression::Predicate(child) => Self::collect(child, references),
                Expression::StringList(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Operator;

    fn values(entries: &[(&str, &[&str])]) -> ResolvedValues {
        entries
            .iter()
            .map(|(path, vals)| {
                (
                    PropertyRef::new(*path),
                    vals.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_leaf_with_resolved_property() {
        let predicate = Predicate::compare(Operator::AnyEquals, "p", &["value1", "value2"]);
        let resolved = values(&[("p", &["value1", "value3"])]);
        assert!(PredicateEvaluator::evaluate(&predicate, &resolved).unwrap());
    }

    #[test]
    fn test_missing_property_is_empty() {
        let predicate = Predicate::property(Operator::Exists, "missing");
        assert!(!PredicateEvaluator::evaluate(&predicate, &ResolvedValues::new()).unwrap());

        let predicate = Predicate::property(Operator::IsFalse, "missing");
        assert!(PredicateEvaluator::evaluate(&predicate, &ResolvedValues::new()).unwrap());
    }

    #[test]
    fn test_negation_flips_result() {
        let predicate = Predicate::property(Operator::Exists, "p").negate();
        let resolved = values(&[("p", &["x"])]);
        assert!(!PredicateEvaluator::evaluate(&predicate, &resolved).unwrap());
        assert!(PredicateEvaluator::evaluate(&predicate, &ResolvedValues::new()).unwrap());
    }

    #[test]
    fn test_nested_logical_tree() {
        // (a EXISTS AND NOT b = x) OR c > 10
        let predicate = Predicate::or(vec![
            Predicate::and(vec![
                Predicate::property(Operator::Exists, "a"),
                Predicate::not(Predicate::compare(Operator::AnyEquals, "b", &["x"])),
            ]),
            Predicate::compare(Operator::GreaterThan, "c", &["10"]),
        ]);

        assert!(PredicateEvaluator::evaluate(&predicate, &values(&[("a", &["1"]), ("b", &["y"])])).unwrap());
        assert!(!PredicateEvaluator::evaluate(&predicate, &values(&[("a", &["1"]), ("b", &["x"])])).unwrap());
        assert!(PredicateEvaluator::evaluate(&predicate, &values(&[("c", &["11"])])).unwrap());
        assert!(!PredicateEvaluator::evaluate(&predicate, &values(&[("c", &["9"])])).unwrap());
    }

    #[test]
    fn test_threshold_and_membership() {
        // num > 5 AND str IN [v1, v2]
        let predicate = Predicate::and(vec![
            Predicate::compare(Operator::GreaterThan, "num", &["5"]),
            Predicate::compare(Operator::AnyEquals, "str", &["v1", "v2"]),
        ]);

        fn check(predicate: &Predicate, entries: &[(&str, &[&str])], expected: bool) {
            assert_eq!(
                PredicateEvaluator::evaluate(predicate, &values(entries)).unwrap(),
                expected,
                "{entries:?}"
            );
        }

        check(&predicate, &[("num", &["7"]), ("str", &["v2"])], true);
        check(&predicate, &[("num", &["3"]), ("str", &["v1"])], false);
        check(&predicate, &[("num", &["7"]), ("str", &["v3"])], false);
        check(&predicate, &[("str", &["v1"])], false);
        check(&predicate, &[("num", &["7"])], false);
        check(&predicate, &[], false);
    }

    #[test]
    fn test_negated_composite() {
        let predicate = Predicate::and(vec![
            Predicate::property(Operator::Exists, "a"),
            Predicate::property(Operator::Exists, "b"),
        ])
        .negate();
        assert!(PredicateEvaluator::evaluate(&predicate, &values(&[("a", &["1"])])).unwrap());
        assert!(!PredicateEvaluator::evaluate(&predicate, &values(&[("a", &["1"]), ("b", &["2"])])).unwrap());
    }

    #[test]
    fn test_extract_references() {
        let predicate = Predicate::or(vec![
            Predicate::property(Operator::Exists, "a"),
            Predicate::not(Predicate::compare(Operator::AnyEquals, "b.c", &["x"])),
            Predicate::property(Operator::IsTrue, "a"),
        ]);
        let references = PredicateEvaluator::extract_references(&predicate);
        assert_eq!(references.len(), 2);
        assert!(references.contains(&PropertyRef::new("a")));
        assert!(references.contains(&PropertyRef::new("b.c")));
    }
}
