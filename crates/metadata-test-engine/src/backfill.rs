//! 全量回填任务
//!
//! 遍历缓存定义覆盖的每种实体类型，分页滚动检索实体，
//! 每页作为一个批次交给引擎评估。批次之间并发执行，并发度受限。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use catalog_shared::config::TestEngineConfig;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::engine::{EvaluationMode, TestEngine};
use crate::error::Result;
use crate::traits::EntitySearch;
use crate::urn::Urn;

/// 回填结果汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub entity_types: Vec<String>,
    pub batches: usize,
    pub entities: usize,
    pub failed_batches: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 全量回填任务
pub struct BackfillJob {
    engine: Arc<TestEngine>,
    search: Arc<dyn EntitySearch>,
    batch_size: usize,
    concurrency: usize,
}

impl BackfillJob {
    pub fn new(engine: Arc<TestEngine>, search: Arc<dyn EntitySearch>, config: &TestEngineConfig) -> Self {
        Self {
            engine,
            search,
            batch_size: config.backfill_batch_size.max(1),
            concurrency: config.backfill_concurrency.max(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 执行一次回填
    ///
    /// 单个批次失败（检索或评估）只记录并计数，不会中止整个任务。
    #[instrument(skip(self), fields(batch_size = self.batch_size, concurrency = self.concurrency))]
    pub async fn run(&self, mode: EvaluationMode) -> BackfillReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let entity_types: Vec<String> = self.engine.entity_types_to_evaluate().into_iter().collect();
        if entity_types.is_empty() {
            warn!("缓存中没有测试定义，回填任务无事可做");
        }

        let mut batches = 0usize;
        let mut entities = 0usize;
        let mut failed_batches = 0usize;

        for entity_type in &entity_types {
            let outcomes: Vec<Result<usize>> = self
                .scroll_batches(entity_type)
                .map(|batch| self.evaluate_batch(batch, mode))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                batches += 1;
                match outcome {
                    Ok(count) => entities += count,
                    Err(e) => {
                        failed_batches += 1;
                        error!(entity_type = %entity_type, error = %e, "回填批次失败");
                    }
                }
            }
        }

        let report = BackfillReport {
            entity_types,
            batches,
            entities,
            failed_batches,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            batches = report.batches,
            entities = report.entities,
            failed_batches = report.failed_batches,
            duration_ms = started.elapsed().as_millis() as u64,
            "回填任务完成"
        );
        report
    }

    /// 按游标依次读取实体页；检索出错时产出错误并结束该类型
    fn scroll_batches<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl futures::Stream<Item = Result<Vec<Urn>>> + 'a {
        let search = &self.search;
        let batch_size = self.batch_size;

        // None 表示已结束，Some(cursor) 表示下一页的游标
        stream::unfold(Some(None::<String>), move |state| async move {
            let cursor = state?;
            match search.scroll(entity_type, batch_size, cursor).await {
                Ok(page) if page.urns.is_empty() => None,
                Ok(page) => {
                    let next = page.next_cursor.map(Some);
                    Some((Ok(page.urns), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn evaluate_batch(&self, batch: Result<Vec<Urn>>, mode: EvaluationMode) -> Result<usize> {
        let urns: BTreeSet<Urn> = batch?.into_iter().collect();
        self.engine.batch_evaluate(&urns, mode).await?;
        Ok(urns.len())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::engine::EngineCollaborators;
    use crate::error::TestEngineError;
    use crate::models::{DefinitionPage, RawTestDefinition, ScrollPage};
    use crate::query::EntityRegistry;
    use crate::traits::{
        MockActionApplier, MockDefinitionSource, MockEntitySearch, MockEntityStore, MockResultSink,
    };

    fn urns(entity_type: &str, range: std::ops::Range<usize>) -> Vec<Urn> {
        range
            .map(|i| Urn::parse(&format!("urn:li:{entity_type}:e{i}")).unwrap())
            .collect()
    }

    async fn engine(result_sink: MockResultSink) -> Arc<TestEngine> {
        let mut definitions = MockDefinitionSource::new();
        definitions.expect_fetch_definitions().returning(|_, _| {
            Ok(DefinitionPage {
                items: vec![RawTestDefinition {
                    id: "urn:li:test:exists".to_string(),
                    definition: json!({
                        "on": {"types": ["dataset", "chart"]},
                        "rules": {"property": "urn", "operator": "exists"}
                    })
                    .to_string(),
                }],
                total: 1,
            })
        });
        let engine = TestEngine::new(
            EngineCollaborators {
                definitions: Arc::new(definitions),
                entity_store: Arc::new(MockEntityStore::new()),
                result_sink: Arc::new(result_sink),
                action_applier: Arc::new(MockActionApplier::new()),
            },
            Arc::new(EntityRegistry::standard()),
            &TestEngineConfig::default(),
        );
        engine.refresh_now().await.unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_backfill_scrolls_every_type() {
        let mut search = MockEntitySearch::new();
        search.expect_scroll().returning(|entity_type, batch_size, cursor| {
            let total = if entity_type == "dataset" { 5 } else { 2 };
            let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (offset + batch_size).min(total);
            Ok(ScrollPage {
                urns: urns(entity_type, offset..end),
                next_cursor: (end < total).then(|| end.to_string()),
            })
        });

        let persisted = Arc::new(Mutex::new(Vec::new()));
        let recorder = persisted.clone();
        let mut sink = MockResultSink::new();
        sink.expect_persist_result().returning(move |urn, _| {
            recorder.lock().push(urn.clone());
            Ok(())
        });

        let job = BackfillJob::new(engine(sink).await, Arc::new(search), &TestEngineConfig::default())
            .with_batch_size(2)
            .with_concurrency(2);
        let report = job.run(EvaluationMode::Default).await;

        assert_eq!(report.entity_types, vec!["chart", "dataset"]);
        assert_eq!(report.batches, 4);
        assert_eq!(report.entities, 7);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(persisted.lock().len(), 7);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted() {
        let mut search = MockEntitySearch::new();
        search.expect_scroll().returning(|entity_type, _, cursor| {
            match (entity_type, cursor.as_deref()) {
                ("dataset", None) => Ok(ScrollPage {
                    urns: urns("dataset", 0..3),
                    next_cursor: Some("next".to_string()),
                }),
                ("dataset", Some(_)) => Err(TestEngineError::Search("游标已过期".to_string())),
                _ => Ok(ScrollPage::default()),
            }
        });

        let job = BackfillJob::new(
            engine(MockResultSink::new()).await,
            Arc::new(search),
            &TestEngineConfig::default(),
        );
        let report = job.run(EvaluationMode::EvaluateOnly).await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.entities, 3);
        assert_eq!(report.failed_batches, 1);
    }
}
