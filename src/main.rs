use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};

use tenant_service::app::Application;
use tenant_service::common::{
    init_logging, init_metrics, load_config, wait_for_shutdown_signal, StartupConfig,
};
use tenant_service::shutdown::{DrainOutcome, ShutdownManager};

fn cli() -> Command {
    Command::new("tenant-service")
        .version("1.0.0")
        .about("租户管理服务 - 任务消息队列客户端")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("run").about("消费任务状态事件并转发给中继（默认）"))
        .subcommand(
            Command::new("publish")
                .about("创建并发布一个任务")
                .arg(
                    Arg::new("description")
                        .short('d')
                        .long("description")
                        .value_name("TEXT")
                        .help("任务描述")
                        .required(true),
                )
                .arg(
                    Arg::new("tag")
                        .short('t')
                        .long("tag")
                        .value_name("TAG")
                        .help("任务标签，可重复指定")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("complete")
                        .long("complete")
                        .help("发布后立即发布完成状态")
                        .action(ArgAction::SetTrue),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let startup = StartupConfig {
        config_path: matches.get_one::<String>("config").cloned(),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format: matches.get_one::<String>("log-format").cloned(),
    };

    let config = load_config(&startup)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    init_metrics(&config.observability)?;

    match matches.subcommand() {
        Some(("publish", sub)) => publish(Application::new(config)?, sub).await,
        _ => run(Application::new(config)?).await,
    }
}

async fn run(app: Application) -> Result<()> {
    info!("启动租户管理服务任务队列客户端");

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe().await;

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    if shutdown_manager.drain(app_handle).await == DrainOutcome::Completed {
        info!("应用已优雅关闭");
    }

    info!("租户管理服务已退出");
    Ok(())
}

async fn publish(app: Application, matches: &ArgMatches) -> Result<()> {
    let description = matches
        .get_one::<String>("description")
        .cloned()
        .unwrap_or_default();
    let tags: Vec<String> = matches
        .get_many::<String>("tag")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let complete = matches.get_flag("complete");

    let task = app.publish(tags, &description, complete).await?;
    info!(task_id = %task.id, status = %task.status, "任务已发布");
    println!("{}", task.id);
    Ok(())
}
