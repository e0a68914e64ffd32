//! 操作符定义

use std::fmt;

/// 操作数的值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 字符串列表（属性引用与字面量都属于此类）
    StringList,
    /// 布尔值（嵌套谓词）
    Boolean,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::StringList => write!(f, "list<string>"),
            ValueType::Boolean => write!(f, "boolean"),
        }
    }
}

/// 操作符的元数约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// 至少一个布尔操作数
    Variadic,
    /// 恰好一个指定类型的操作数
    Unary(ValueType),
    /// 属性 + 字符串列表
    Binary,
}

/// 谓词操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    And,
    Or,
    Not,
    Exists,
    AnyEquals,
    ContainsAny,
    ContainsStr,
    StartsWith,
    RegexMatch,
    IsTrue,
    IsFalse,
    GreaterThan,
    LessThan,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::And,
        Operator::Or,
        Operator::Not,
        Operator::Exists,
        Operator::AnyEquals,
        Operator::ContainsAny,
        Operator::ContainsStr,
        Operator::StartsWith,
        Operator::RegexMatch,
        Operator::IsTrue,
        Operator::IsFalse,
        Operator::GreaterThan,
        Operator::LessThan,
    ];

    /// 规则文档中使用的通用名
    pub fn common_name(&self) -> &'static str {
        match self {
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Not => "not",
            Operator::Exists => "exists",
            Operator::AnyEquals => "equals",
            Operator::ContainsAny => "contains_any",
            Operator::ContainsStr => "contains_str",
            Operator::StartsWith => "starts_with",
            Operator::RegexMatch => "regex_match",
            Operator::IsTrue => "is_true",
            Operator::IsFalse => "is_false",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
        }
    }

    /// 操作符符号名
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Not => "NOT",
            Operator::Exists => "EXISTS",
            Operator::AnyEquals => "ANY_EQUALS",
            Operator::ContainsAny => "CONTAINS_ANY",
            Operator::ContainsStr => "CONTAINS_STR",
            Operator::StartsWith => "STARTS_WITH",
            Operator::RegexMatch => "REGEX_MATCH",
            Operator::IsTrue => "IS_TRUE",
            Operator::IsFalse => "IS_FALSE",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::LessThan => "LESS_THAN",
        }
    }

    /// 按通用名或符号名查找（大小写不敏感）
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| {
            op.common_name().eq_ignore_ascii_case(name) || op.symbol().eq_ignore_ascii_case(name)
        })
    }

    pub fn arity(&self) -> Arity {
        match self {
            Operator::And | Operator::Or => Arity::Variadic,
            Operator::Not => Arity::Unary(ValueType::Boolean),
            Operator::Exists | Operator::IsTrue | Operator::IsFalse => {
                Arity::Unary(ValueType::StringList)
            }
            Operator::AnyEquals
            | Operator::ContainsAny
            | Operator::ContainsStr
            | Operator::StartsWith
            | Operator::RegexMatch
            | Operator::GreaterThan
            | Operator::LessThan => Arity::Binary,
        }
    }

    /// 是否为逻辑操作符（操作数为嵌套谓词）
    pub fn is_logical(&self) -> bool {
        matches!(self, Operator::And | Operator::Or | Operator::Not)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.common_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_common_name_and_symbol() {
        assert_eq!(Operator::from_name("equals"), Some(Operator::AnyEquals));
        assert_eq!(Operator::from_name("EQUALS"), Some(Operator::AnyEquals));
        assert_eq!(Operator::from_name("any_equals"), Some(Operator::AnyEquals));
        assert_eq!(Operator::from_name("Regex_Match"), Some(Operator::RegexMatch));
        assert_eq!(Operator::from_name("between"), None);
    }

    #[test]
    fn test_every_operator_round_trips_its_names() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_name(op.common_name()), Some(op));
            assert_eq!(Operator::from_name(op.symbol()), Some(op));
        }
    }

    #[test]
    fn test_arity() {
        assert_eq!(Operator::And.arity(), Arity::Variadic);
        assert_eq!(Operator::Not.arity(), Arity::Unary(ValueType::Boolean));
        assert_eq!(Operator::Exists.arity(), Arity::Unary(ValueType::StringList));
        assert_eq!(Operator::GreaterThan.arity(), Arity::Binary);
        assert!(Operator::Or.is_logical());
        assert!(!Operator::StartsWith.is_logical());
    }
}
