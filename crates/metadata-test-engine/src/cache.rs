//! 测试定义缓存
//!
//! 两个索引（按 id、按实体类型）放在同一个不可变快照里，刷新时通过 `ArcSwap`
//! 一次性替换，读取端只做一次原子 load，不会看到两个索引不一致的中间状态。
//!
//! 后台刷新任务启动时立即刷新一次，此后按固定间隔刷新，收到失效通知时提前刷新。
//! 拉取失败时保留旧快照，等待下一轮。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use catalog_shared::observability::metrics;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::models::TestDefinition;
use crate::parser::TestDefinitionParser;
use crate::traits::DefinitionSource;

/// 缓存快照
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    by_id: HashMap<String, Arc<TestDefinition>>,
    by_entity_type: HashMap<String, Vec<Arc<TestDefinition>>>,
}

impl CacheSnapshot {
    /// 由一批定义构建；id 重复时后出现的覆盖先出现的
    pub fn build(definitions: Vec<TestDefinition>) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, Arc<TestDefinition>> = HashMap::new();
        for definition in definitions {
            if !by_id.contains_key(&definition.id) {
                order.push(definition.id.clone());
            }
            by_id.insert(definition.id.clone(), Arc::new(definition));
        }

        let mut by_entity_type: HashMap<String, Vec<Arc<TestDefinition>>> = HashMap::new();
        for id in &order {
            let Some(definition) = by_id.get(id) else {
                continue;
            };
            for entity_type in &definition.targeting.entity_types {
                by_entity_type
                    .entry(entity_type.clone())
                    .or_default()
                    .push(definition.clone());
            }
        }

        Self {
            by_id,
            by_entity_type,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TestDefinition>> {
        self.by_id.get(id)
    }

    /// 以指定实体类型为目标的定义，保持加载顺序
    pub fn for_entity_type(&self, entity_type: &str) -> &[Arc<TestDefinition>] {
        self.by_entity_type
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity_types(&self) -> BTreeSet<String> {
        self.by_entity_type.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// 测试定义缓存
pub struct DefinitionCache {
    current: ArcSwap<CacheSnapshot>,
    source: Arc<dyn DefinitionSource>,
    parser: TestDefinitionParser,
    page_size: usize,
}

impl DefinitionCache {
    pub fn new(source: Arc<dyn DefinitionSource>, page_size: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(CacheSnapshot::default()),
            source,
            parser: TestDefinitionParser::new(),
            page_size: page_size.max(1),
        }
    }

    /// 当前快照（一次原子 load）
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current.load_full()
    }

    /// 分页拉取全部定义并替换快照
    ///
    /// 无法解析的定义记录告警后跳过；任一页拉取失败则中止，旧快照保持不变。
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let started = Instant::now();
        let mut definitions = Vec::new();
        let mut skipped = 0usize;
        let mut offset = 0usize;

        loop {
            let page = match self.source.fetch_definitions(offset, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, offset, "拉取测试定义失败，保留当前缓存");
                    metrics::record_cache_refresh(false, 0);
                    return Err(e);
                }
            };

            let fetched = page.items.len();
            for raw in page.items {
                match self.parser.parse(&raw.id, &raw.definition) {
                    Ok(definition) => definitions.push(definition),
                    Err(e) => {
                        warn!(test = %raw.id, error = %e, "测试定义无法解析，已跳过");
                        skipped += 1;
                    }
                }
            }

            offset += fetched;
            debug!(offset, total = page.total, "已拉取一页测试定义");
            if fetched == 0 || offset >= page.total {
                break;
            }
        }

        let snapshot = CacheSnapshot::build(definitions);
        let tests = snapshot.len();
        self.current.store(Arc::new(snapshot));
        metrics::record_cache_refresh(true, tests);

        info!(
            tests,
            skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "测试定义缓存已刷新"
        );
        Ok(tests)
    }
}

/// 后台刷新任务的控制句柄
///
/// drop 时通知任务退出。
pub struct CacheRefresher {
    invalidation: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheRefresher {
    /// 请求立即刷新
    pub fn invalidate(&self) {
        self.invalidation.notify_one();
    }

    /// 停止刷新任务并等待其退出
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "缓存刷新任务异常退出");
            }
        }
    }
}

impl Drop for CacheRefresher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// 启动后台刷新任务：立即刷新一次，此后每隔 `interval` 刷新，失效时提前刷新
pub fn spawn_refresh_loop(cache: Arc<DefinitionCache>, interval: Duration) -> CacheRefresher {
    let invalidation = Arc::new(Notify::new());
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let notified = invalidation.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notified.notified() => {
                    debug!("收到缓存失效通知");
                    ticker.reset();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("测试定义缓存刷新任务已停止");
                        break;
                    }
                    continue;
                }
            }

            // 失败已在 refresh 内记录，等待下一轮
            let _ = cache.refresh().await;
        }
    });

    CacheRefresher {
        invalidation,
        shutdown,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::TestEngineError;
    use crate::models::{DefinitionPage, RawTestDefinition};
    use crate::traits::MockDefinitionSource;

    fn raw(id: &str, types: &[&str]) -> RawTestDefinition {
        RawTestDefinition {
            id: id.to_string(),
            definition: serde_json::json!({
                "on": {"types": types},
                "rules": {"property": "urn", "operator": "exists"}
            })
            .to_string(),
        }
    }

    fn paged_source(items: Vec<RawTestDefinition>) -> MockDefinitionSource {
        let mut source = MockDefinitionSource::new();
        source.expect_fetch_definitions().returning(move |offset, count| {
            Ok(DefinitionPage {
                items: items.iter().skip(offset).take(count).cloned().collect(),
                total: items.len(),
            })
        });
        source
    }

    #[test]
    fn test_snapshot_indexes() {
        let parser = TestDefinitionParser::new();
        let definitions = vec![
            parser.parse("t1", &raw("t1", &["dataset", "chart"]).definition).unwrap(),
            parser.parse("t2", &raw("t2", &["dataset"]).definition).unwrap(),
            parser.parse("t1", &raw("t1", &["dashboard"]).definition).unwrap(),
        ];

        let snapshot = CacheSnapshot::build(definitions);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("t1").unwrap().targeting.matches_type("dashboard"));
        // 被覆盖的旧定义不再出现在类型索引中
        assert!(snapshot.for_entity_type("chart").is_empty());
        let dataset: Vec<_> = snapshot.for_entity_type("dataset").iter().map(|d| d.id.as_str()).collect();
        assert_eq!(dataset, vec!["t2"]);
        assert_eq!(
            snapshot.entity_types().into_iter().collect::<Vec<_>>(),
            vec!["dashboard", "dataset"]
        );
    }

    #[tokio::test]
    async fn test_refresh_paginates_and_skips_invalid() {
        let mut items: Vec<RawTestDefinition> =
            (0..7).map(|i| raw(&format!("t{i}"), &["dataset"])).collect();
        items.push(RawTestDefinition {
            id: "broken".to_string(),
            definition: "{\"on\": {}}".to_string(),
        });

        let cache = DefinitionCache::new(Arc::new(paged_source(items)), 3);
        let loaded = cache.refresh().await.unwrap();

        assert_eq!(loaded, 7);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.for_entity_type("dataset").len(), 7);
        assert!(snapshot.get("broken").is_none());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = MockDefinitionSource::new();
        source.expect_fetch_definitions().returning(move |offset, _| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(DefinitionPage {
                    items: vec![raw("t1", &["dataset"])],
                    total: 1,
                })
            } else if offset == 0 {
                Err(TestEngineError::DefinitionFetch("存储不可用".to_string()))
            } else {
                unreachable!()
            }
        });

        let cache = DefinitionCache::new(Arc::new(source), 10);
        cache.refresh().await.unwrap();
        assert_eq!(cache.snapshot().len(), 1);

        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, TestEngineError::DefinitionFetch(_)));
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_ticks_and_invalidation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = MockDefinitionSource::new();
        source.expect_fetch_definitions().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(DefinitionPage {
                items: vec![raw("t1", &["dataset"])],
                total: 1,
            })
        });

        let cache = Arc::new(DefinitionCache::new(Arc::new(source), 10));
        let refresher = spawn_refresh_loop(cache.clone(), Duration::from_secs(180));

        // 启动后立即刷新一次
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.snapshot().len(), 1);

        // 失效通知触发提前刷新
        refresher.invalidate();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // 定时刷新
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        refresher.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
