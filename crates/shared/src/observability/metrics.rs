//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时各 `record_*` 函数为空操作。

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    addr: SocketAddr,
    _exporter: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// 安装 Prometheus recorder 并在指定端口启动 `/metrics` 监听
///
/// 需要在 tokio runtime 内调用。
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .context("构建 Prometheus exporter 失败")?;

    let _ = PROMETHEUS_HANDLE.set(recorder.handle());
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("全局 metrics recorder 已被设置"))?;

    let exporter = tokio::spawn(async move {
        if let Err(e) = exporter.await {
            error!(error = ?e, "Metrics exporter error");
        }
    });

    describe_metrics();
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);

    info!(%addr, "Metrics exporter listening");
    Ok(MetricsHandle {
        addr,
        _exporter: exporter,
    })
}

/// 描述指标，出现在 `/metrics` 的 HELP 注释中
fn describe_metrics() {
    metrics::describe_counter!(
        "metadata_test_evaluations_total",
        "Total number of metadata test evaluations"
    );
    metrics::describe_histogram!(
        "metadata_test_evaluation_duration_seconds",
        "Metadata test batch evaluation duration in seconds"
    );
    metrics::describe_counter!(
        "metadata_test_cache_refresh_total",
        "Total number of test definition cache refreshes"
    );
    metrics::describe_gauge!(
        "metadata_test_cached_definitions",
        "Number of test definitions currently cached"
    );
    metrics::describe_counter!(
        "metadata_test_aspect_fetches_total",
        "Total number of aspect fetches issued to the entity store"
    );
    metrics::describe_counter!(
        "metadata_test_actions_total",
        "Total number of test actions applied"
    );
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一次测试评估结论
#[inline]
pub fn record_test_evaluation(entity_type: &str, passed: bool) {
    metrics::counter!(
        "metadata_test_evaluations_total",
        "entity_type" => entity_type.to_string(),
        "verdict" => if passed { "success" } else { "failure" }
    )
    .increment(1);
}

/// 记录一次批量评估耗时
#[inline]
pub fn record_evaluation_duration(entity_type: &str, duration_secs: f64) {
    metrics::histogram!(
        "metadata_test_evaluation_duration_seconds",
        "entity_type" => entity_type.to_string()
    )
    .record(duration_secs);
}

/// 记录定义缓存刷新
#[inline]
pub fn record_cache_refresh(success: bool, cached_definitions: usize) {
    metrics::counter!(
        "metadata_test_cache_refresh_total",
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);

    if success {
        metrics::gauge!("metadata_test_cached_definitions").set(cached_definitions as f64);
    }
}

/// 记录一次后端切面读取
#[inline]
pub fn record_aspect_fetch(entity_type: &str, evaluator: &str) {
    metrics::counter!(
        "metadata_test_aspect_fetches_total",
        "entity_type" => entity_type.to_string(),
        "evaluator" => evaluator.to_string()
    )
    .increment(1);
}

/// 记录一次动作执行
#[inline]
pub fn record_action_applied(kind: &str, success: bool) {
    metrics::counter!(
        "metadata_test_actions_total",
        "kind" => kind.to_string(),
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
