use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hotpush_lib::core::format_file_tree;
use hotpush_lib::logging::{init_logging, log_dir, LogConfig};
use hotpush_lib::{AppState, ReloaderConfig, CONFIG_FILE};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "hotpush")]
#[command(version)]
#[command(about = "热重载与增量推送：修改代码后自动同步到设备并重新加载")]
struct Cli {
    /// 项目根目录
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 在项目目录生成默认配置文件
    Init {
        /// 覆盖已有配置
        #[arg(short, long)]
        force: bool,
    },

    /// 监听文件变化，推送到设备并在本地重载
    #[command(visible_aliases = ["run", "start"])]
    Watch,

    /// 立即推送一次当前变更
    Push {
        /// 以 JSON 输出推送报告
        #[arg(long)]
        json: bool,
    },

    /// 设备端：接收推送并重载
    Serve {
        /// 监听地址
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },

    /// 显示与上次提交快照之间的差异
    Status,

    /// 丢弃已提交的快照，下次推送为完整推送
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return init(&cli.project, force);
    }

    let _guard = init_logging(
        &log_dir(&cli.project),
        &LogConfig::load(&cli.project),
        cli.verbose,
    );

    let state = AppState::load(&cli.project)?;
    let signal_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_state.shutdown();
        }
    });

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Watch => state.run_watch().await,
        Commands::Serve { host } => state.run_serve(&host).await,
        Commands::Push { json } => push(&state, json).await,
        Commands::Status => status(&state).await,
        Commands::Reset => {
            state.push_engine().reset()?;
            println!("已清除提交快照，下次推送将发送完整包");
            Ok(())
        }
    }
}

fn init(project: &Path, force: bool) -> anyhow::Result<()> {
    let path = project.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} 已存在，使用 --force 覆盖", path.display());
    }
    ReloaderConfig::default()
        .save(project)
        .with_context(|| format!("写入 {} 失败", path.display()))?;
    println!("已生成 {}", path.display());
    Ok(())
}

async fn push(state: &AppState, json: bool) -> anyhow::Result<()> {
    let mut engine = state.push_engine();
    let report = engine.run_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_noop() {
        println!("没有需要推送的变更");
    } else {
        for device in &report.devices {
            match &device.error {
                None => println!("✓ {} ({} 字节)", device.device, device.bytes),
                Some(e) => println!("✗ {}: {}", device.device, e),
            }
        }
        println!(
            "{} 个文件, {} 个删除, 耗时 {}ms",
            report.files_sent, report.files_deleted, report.duration_ms
        );
    }

    if !report.is_noop() && !report.all_acknowledged() {
        bail!("部分设备未确认更新，快照未提交");
    }
    Ok(())
}

async fn status(state: &AppState) -> anyhow::Result<()> {
    let status = state.push_engine().status().await?;
    if status.changes.is_empty() {
        println!("没有变更 (共 {} 个文件)", status.total_files);
        return Ok(());
    }

    println!("{}", format_file_tree(&status.changes.added, "新增"));
    println!("{}", format_file_tree(&status.changes.modified, "修改"));
    println!("{}", format_file_tree(&status.changes.deleted, "删除"));
    println!(
        "{} / {} 个文件有变更，下次推送方式: {}",
        status.changes.changed_count(),
        status.total_files,
        status.kind
    );
    Ok(())
}
