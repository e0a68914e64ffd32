//! 操作符评估器
//!
//! 每个操作符提供 `validate`（解析期检查操作数个数与类型）和
//! `evaluate`（对已解析的操作数求值）两部分。
//!
//! 字符串类操作符作用在属性的值集合上：只要左侧某个值与右侧某个值满足关系即为真。
//! 空字符串等同于不存在，两侧都会被忽略。

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, TestEngineError};
use crate::models::{Expression, Operand};
use crate::operators::{Arity, Operator, ValueType};

/// 求值时的操作数
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedOperand<'a> {
    /// 属性解析出的值集合或字面量列表；属性缺失时为空
    Values(&'a [String]),
    /// 嵌套谓词的结果
    Boolean(bool),
}

/// 操作符评估器
pub struct OperatorEvaluator;

impl OperatorEvaluator {
    /// 校验操作数是否满足操作符的元数约定
    pub fn validate(operator: Operator, operands: &[Operand]) -> Result<()> {
        match operator.arity() {
            Arity::Variadic => {
                if operands.is_empty() {
                    return Err(invalid(operator, "至少需要一个操作数".to_string()));
                }
                for operand in operands {
                    Self::expect_type(operator, operand, ValueType::Boolean)?;
                }
            }
            Arity::Unary(expected) => {
                Self::expect_count(operator, operands.len(), 1)?;
                Self::expect_type(operator, &operands[0], expected)?;
            }
            Arity::Binary => {
                Self::expect_count(operator, operands.len(), 2)?;
                for operand in operands {
                    Self::expect_type(operator, operand, ValueType::StringList)?;
                }
                if operator == Operator::RegexMatch {
                    Self::validate_patterns(&operands[1])?;
                }
            }
        }
        Ok(())
    }

    /// 对已解析的操作数求值
    pub fn evaluate(operator: Operator, operands: &[ResolvedOperand<'_>]) -> Result<bool> {
        let result = match operator {
            Operator::And => Self::booleans(operator, operands)?.into_iter().all(|b| b),
            Operator::Or => Self::booleans(operator, operands)?.into_iter().any(|b| b),
            Operator::Not => {
                let values = Self::booleans(operator, operands)?;
                Self::expect_count(operator, values.len(), 1)?;
                !values[0]
            }
            Operator::Exists => present(Self::unary(operator, operands)?).next().is_some(),
            // 只有值为 "true" 才成立，其他非空值不视为真
            Operator::IsTrue => {
                present(Self::unary(operator, operands)?).any(|v| v.eq_ignore_ascii_case("true"))
            }
            Operator::IsFalse => {
                let mut values = present(Self::unary(operator, operands)?).peekable();
                values.peek().is_none() || values.any(|v| v.eq_ignore_ascii_case("false"))
            }
            Operator::AnyEquals | Operator::ContainsAny => {
                let (left, right) = Self::binary(operator, operands)?;
                any_pair(left, right, |l, r| l == r)
            }
            Operator::ContainsStr => {
                let (left, right) = Self::binary(operator, operands)?;
                any_pair(left, right, |l, r| l.contains(r))
            }
            Operator::StartsWith => {
                let (left, right) = Self::binary(operator, operands)?;
                any_pair(left, right, |l, r| l.starts_with(r))
            }
            Operator::RegexMatch => {
                let (left, right) = Self::binary(operator, operands)?;
                Self::regex_match(left, right)
            }
            Operator::GreaterThan => {
                let (left, right) = Self::binary(operator, operands)?;
                Self::numeric(left, right, |l, r| l > r)
            }
            Operator::LessThan => {
                let (left, right) = Self::binary(operator, operands)?;
                Self::numeric(left, right, |l, r| l < r)
            }
        };
        debug!(operator = %operator, result, "操作符求值");
        Ok(result)
    }

    fn expect_count(operator: Operator, actual: usize, expected: usize) -> Result<()> {
        if actual != expected {
            return Err(invalid(
                operator,
                format!("需要 {} 个操作数，实际为 {}", expected, actual),
            ));
        }
        Ok(())
    }

    fn expect_type(operator: Operator, operand: &Operand, expected: ValueType) -> Result<()> {
        let actual = operand.expression.value_type();
        if actual != expected {
            return Err(invalid(
                operator,
                format!(
                    "第 {} 个操作数类型应为 {}，实际为 {}",
                    operand.index, expected, actual
                ),
            ));
        }
        Ok(())
    }

    fn validate_patterns(operand: &Operand) -> Result<()> {
        if let Expression::StringList(patterns) = &operand.expression {
            for pattern in patterns {
                anchored(pattern).map_err(|e| {
                    invalid(Operator::RegexMatch, format!("无效的正则表达式 {pattern}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    fn booleans(operator: Operator, operands: &[ResolvedOperand<'_>]) -> Result<Vec<bool>> {
        operands
            .iter()
            .map(|operand| match operand {
                ResolvedOperand::Boolean(b) => Ok(*b),
                ResolvedOperand::Values(_) => Err(invalid(
                    operator,
                    "操作数应为布尔值，实际为字符串列表".to_string(),
                )),
            })
            .collect()
    }

    fn unary<'a>(operator: Operator, operands: &[ResolvedOperand<'a>]) -> Result<&'a [String]> {
        Self::expect_count(operator, operands.len(), 1)?;
        Self::values(operator, &operands[0])
    }

    fn binary<'a>(
        operator: Operator,
        operands: &[ResolvedOperand<'a>],
    ) -> Result<(&'a [String], &'a [String])> {
        Self::expect_count(operator, operands.len(), 2)?;
        Ok((
            Self::values(operator, &operands[0])?,
            Self::values(operator, &operands[1])?,
        ))
    }

    fn values<'a>(operator: Operator, operand: &ResolvedOperand<'a>) -> Result<&'a [String]> {
        match operand {
            ResolvedOperand::Values(values) => Ok(*values),
            ResolvedOperand::Boolean(_) => Err(invalid(
                operator,
                "操作数应为字符串列表，实际为布尔值".to_string(),
            )),
        }
    }

    /// 正则需完整匹配；无法编译的模式跳过
    fn regex_match(left: &[String], patterns: &[String]) -> bool {
        let compiled: Vec<Regex> = present(patterns)
            .filter_map(|pattern| match anchored(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern, error = %e, "正则表达式无法编译，已跳过");
                    None
                }
            })
            .collect();
        present(left).any(|value| compiled.iter().any(|regex| regex.is_match(value)))
    }

    /// 两侧都能解析为数字的组合才参与比较
    fn numeric<F>(left: &[String], right: &[String], cmp: F) -> bool
    where
        F: Fn(f64, f64) -> bool,
    {
        let right: Vec<f64> = present(right).filter_map(as_f64).collect();
        present(left)
            .filter_map(as_f64)
            .any(|l| right.iter().any(|r| cmp(l, *r)))
    }
}

fn invalid(operator: Operator, message: String) -> TestEngineError {
    TestEngineError::InvalidOperand(format!("{}: {}", operator.symbol(), message))
}

/// 非空值
fn present(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().map(String::as_str).filter(|v| !v.is_empty())
}

fn any_pair<F>(left: &[String], right: &[String], relation: F) -> bool
where
    F: Fn(&str, &str) -> bool,
{
    present(left).any(|l| present(right).any(|r| relation(l, r)))
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn as_f64(value: &str) -> Option<f64> {
    match value.trim().parse::<f64>() {
        Ok(number) if number.is_finite() => Some(number),
        _ => {
            debug!(value, "无法解析为数字，跳过该值");
            None
        }
    }
}
