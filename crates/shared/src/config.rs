//! 配置管理模块
//!
//! 分层加载配置文件与环境变量，提供类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "CATALOG";

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 测试引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestEngineConfig {
    /// 定义缓存的刷新间隔
    pub refresh_interval_secs: u64,
    /// 拉取定义时的分页大小
    pub page_size: usize,
    /// 回填时每批实体数
    pub backfill_batch_size: usize,
    /// 回填时并发评估的批次数
    pub backfill_concurrency: usize,
}

impl Default for TestEngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 180,
            page_size: 30,
            backfill_batch_size: 1000,
            backfill_concurrency: 4,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
    pub test_engine: TestEngineConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml
    /// 2. config/{environment}.toml
    /// 3. config/{service_name}.toml
    /// 4. 环境变量（CATALOG_ 前缀，层级用 `__` 分隔，如
    ///    CATALOG_TEST_ENGINE__PAGE_SIZE -> test_engine.page_size）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CATALOG_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    /// 从指定目录与环境加载
    pub fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
