//! 命令行前端
//!
//! 基于内存协作方运行引擎：校验定义、在夹具数据上评估实体、执行回填。
//! 各子命令的输出均为 JSON。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use catalog_shared::config::TestEngineConfig;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use crate::backfill::BackfillJob;
use crate::engine::{EngineCollaborators, EvaluationMode, TestEngine};
use crate::memory::InMemoryMetadataStore;
use crate::models::TestResults;
use crate::query::EntityRegistry;
use crate::urn::Urn;

/// 元数据测试引擎命令行工具
#[derive(Parser, Debug)]
#[command(name = "test-engine", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 校验测试定义文件，输出校验结果
    Validate {
        /// 测试定义 JSON 文件
        file: PathBuf,
    },

    /// 在夹具数据上评估实体
    Evaluate(EvaluateArgs),

    /// 对夹具中的全部实体执行回填
    Backfill(BackfillArgs),
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// 夹具文件，包含测试定义与实体切面
    #[arg(long)]
    pub fixtures: PathBuf,

    /// 要评估的实体，缺省时评估定义覆盖的全部实体
    #[arg(long = "urn")]
    pub urns: Vec<String>,

    /// 只评估这些测试
    #[arg(long = "test")]
    pub tests: Vec<String>,

    /// 只评估，不写结果也不执行动作
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct BackfillArgs {
    #[arg(long)]
    pub fixtures: PathBuf,

    #[arg(long)]
    pub dry_run: bool,
}

fn mode(dry_run: bool) -> EvaluationMode {
    if dry_run {
        EvaluationMode::EvaluateOnly
    } else {
        EvaluationMode::Default
    }
}

fn load_store(path: &Path) -> Result<InMemoryMetadataStore> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("读取夹具文件失败: {}", path.display()))?;
    InMemoryMetadataStore::from_fixture(&json)
        .with_context(|| format!("解析夹具文件失败: {}", path.display()))
}

/// 以内存存储作为全部协作方构建引擎，并完成首次加载
async fn build_engine(store: &InMemoryMetadataStore, config: &TestEngineConfig) -> Result<Arc<TestEngine>> {
    let collaborators = EngineCollaborators {
        definitions: Arc::new(store.clone()),
        entity_store: Arc::new(store.clone()),
        result_sink: Arc::new(store.clone()),
        action_applier: Arc::new(store.action_registry()),
    };
    let engine = TestEngine::new(collaborators, Arc::new(EntityRegistry::standard()), config);
    let loaded = engine.refresh_now().await.context("加载测试定义失败")?;
    info!(tests = loaded, "测试定义已加载");
    Ok(Arc::new(engine))
}

/// 执行子命令，返回要输出的 JSON
pub async fn execute(command: Command, config: &TestEngineConfig) -> Result<Value> {
    match command {
        Command::Validate { file } => {
            let definition = std::fs::read_to_string(&file)
                .with_context(|| format!("读取测试定义失败: {}", file.display()))?;
            let engine = build_engine(&InMemoryMetadataStore::new(), config).await?;
            let result = engine.validate(&definition);
            engine.shutdown().await;
            Ok(serde_json::to_value(result)?)
        }
        Command::Evaluate(args) => {
            let store = load_store(&args.fixtures)?;
            let engine = build_engine(&store, config).await?;

            let urns: BTreeSet<Urn> = if args.urns.is_empty() {
                engine
                    .entity_types_to_evaluate()
                    .iter()
                    .flat_map(|entity_type| store.urns(entity_type))
                    .collect()
            } else {
                args.urns
                    .iter()
                    .map(|raw| Urn::parse(raw.as_str()))
                    .collect::<crate::error::Result<_>>()?
            };

            let mode = mode(args.dry_run);
            let results = if args.tests.is_empty() {
                engine.batch_evaluate(&urns, mode).await?
            } else {
                let ids: BTreeSet<String> = args.tests.into_iter().collect();
                engine.batch_evaluate_tests(&urns, &ids, mode).await?
            };
            engine.shutdown().await;

            let ordered: BTreeMap<String, TestResults> = results
                .into_iter()
                .map(|(urn, results)| (urn.to_string(), results))
                .collect();
            Ok(serde_json::to_value(ordered)?)
        }
        Command::Backfill(args) => {
            let store = load_store(&args.fixtures)?;
            let engine = build_engine(&store, config).await?;
            let report = BackfillJob::new(engine.clone(), Arc::new(store), config)
                .run(mode(args.dry_run))
                .await;
            engine.shutdown().await;
            Ok(serde_json::to_value(report)?)
        }
    }
}
