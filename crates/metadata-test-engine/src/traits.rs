//! 外部协作方接口
//!
//! 引擎只通过这些接口访问实体存储、定义存储、结果写入与动作执行，便于替换实现和 mock 测试。

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ActionKind, ActionParams, DefinitionPage, EntityAspects, ScrollPage, TestResults};
use crate::urn::Urn;

/// 实体切面读取接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// 批量读取同一类型实体的指定切面；不存在的实体或切面直接缺省
    async fn fetch_aspects(
        &self,
        entity_type: &str,
        urns: &BTreeSet<Urn>,
        aspects: &BTreeSet<String>,
    ) -> Result<HashMap<Urn, EntityAspects>>;
}

/// 测试定义存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn fetch_definitions(&self, offset: usize, count: usize) -> Result<DefinitionPage>;
}

/// 测试结果写入接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// 覆盖写入实体的测试结果切面
    async fn persist_result(&self, urn: &Urn, results: &TestResults) -> Result<()>;
}

/// 动作执行接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionApplier: Send + Sync {
    async fn apply_action(&self, kind: ActionKind, urns: &[Urn], params: &ActionParams)
    -> Result<()>;

    /// 校验动作参数，默认全部接受
    fn validate_params(&self, _kind: ActionKind, _params: &ActionParams) -> Result<()> {
        Ok(())
    }
}

/// 实体检索接口，供批量回填使用
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitySearch: Send + Sync {
    async fn scroll(
        &self,
        entity_type: &str,
        batch_size: usize,
        cursor: Option<String>,
    ) -> Result<ScrollPage>;
}
