use anyhow::{Context, Result};
use clap::Parser;
use conda_s3_sync::conda::CondaCli;
use conda_s3_sync::config::{parse_s3_location, Args};
use conda_s3_sync::core::{InventoryFilter, OutcomeStatus, SyncConfig, SyncEngine, SyncReport};
use conda_s3_sync::logging;
use conda_s3_sync::storage::S3Store;
use regex::Regex;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match logging::init(&args.log_level, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("日志初始化失败: {e:#}");
            std::process::exit(2);
        }
    };

    let code = match run(args).await {
        Ok(report) if report.success() => 0,
        Ok(_) => 1,
        Err(e) => {
            tracing::error!("同步失败: {e:#}");
            2
        }
    };

    drop(guard);
    std::process::exit(code);
}

async fn run(args: Args) -> Result<SyncReport> {
    let location = parse_s3_location(&args.s3_location)?;

    // 过滤规则错误在任何清单构建之前就终止运行
    let filter = args
        .path_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("--path-filter 不是有效的正则表达式")?;

    let store = Arc::new(S3Store::new(
        &location.bucket,
        args.region.clone(),
        args.endpoint.clone(),
        location.path.clone(),
    )?);
    let manager = Arc::new(CondaCli::new(&args.conda_bin));

    let engine = SyncEngine::new(
        manager,
        store,
        InventoryFilter::new(filter, args.include_base_env),
        SyncConfig {
            max_concurrent: args.concurrency,
            dry_run: args.dry_run,
            ..Default::default()
        },
    );

    let report = engine.run().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    Ok(report)
}

fn print_summary(report: &SyncReport) {
    if report.dry_run {
        println!("同步计划（未执行）:");
        for outcome in &report.outcomes {
            println!(
                "  {} -> {}",
                outcome.name,
                outcome
                    .action
                    .map(|a| format!("{a:?}"))
                    .unwrap_or_else(|| "探测失败".to_string())
            );
        }
        return;
    }

    println!(
        "同步完成: 推送 {}, 拉取 {}, 跳过 {}, 失败 {}",
        report.pushed, report.pulled, report.skipped, report.failed
    );

    for outcome in &report.outcomes {
        if outcome.status == OutcomeStatus::Failed {
            println!(
                "  失败: {} - {}",
                outcome.name,
                outcome.error.as_deref().unwrap_or("未知错误")
            );
        }
    }
}
