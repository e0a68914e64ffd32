//! 实体 URN
//!
//! 形如 `urn:li:<entityType>:<key>`，实体类型取第三段。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TestEngineError};

const URN_PREFIX: &str = "urn:li:";

/// 实体的稳定标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    raw: String,
    type_end: usize,
}

impl Urn {
    /// 解析 URN 字符串
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let type_end = {
            let rest = raw
                .strip_prefix(URN_PREFIX)
                .ok_or_else(|| TestEngineError::InvalidUrn(raw.clone()))?;
            match rest.split_once(':') {
                Some((entity_type, key)) if !entity_type.is_empty() && !key.is_empty() => {
                    URN_PREFIX.len() + entity_type.len()
                }
                _ => return Err(TestEngineError::InvalidUrn(raw.clone())),
            }
        };
        Ok(Self { raw, type_end })
    }

    /// 实体类型，如 `dataset`、`glossaryTerm`
    pub fn entity_type(&self) -> &str {
        &self.raw[URN_PREFIX.len()..self.type_end]
    }

    /// 类型之后的实体键
    pub fn key(&self) -> &str {
        &self.raw[self.type_end + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Urn {
    type Err = TestEngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = TestEngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.raw
    }
}
