//! 错误类型定义

use thiserror::Error;

/// 元数据测试引擎错误
#[derive(Error, Debug)]
pub enum TestEngineError {
    /// 规则文档不合法（JSON 格式、语法或操作数校验失败）
    #[error("规则定义解析失败: {0}")]
    Parse(String),

    /// 操作符的操作数个数或类型不符合约定
    #[error("操作数无效: {0}")]
    InvalidOperand(String),

    #[error("无效的实体 URN: {0}")]
    InvalidUrn(String),

    #[error("实体存储读取失败: {0}")]
    EntityStore(String),

    #[error("规则定义拉取失败: {0}")]
    DefinitionFetch(String),

    #[error("测试结果写入失败: {0}")]
    Persist(String),

    #[error("动作执行失败 [{kind}]: {message}")]
    Action { kind: String, message: String },

    #[error("实体检索失败: {0}")]
    Search(String),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl TestEngineError {
    /// 是否来自外部协作方（存储、检索、动作执行等）
    pub fn is_collaborator_error(&self) -> bool {
        matches!(
            self,
            Self::EntityStore(_)
                | Self::DefinitionFetch(_)
                | Self::Persist(_)
                | Self::Action { .. }
                | Self::Search(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TestEngineError>;
