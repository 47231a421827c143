//! ATP CLI 应用

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "atp")]
#[command(about = "OCloudView ATP - 基础设施验收测试执行与恢复引擎", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行测试用例（含依赖）
    Run(RunArgs),

    /// 测试用例管理
    Testcase {
        #[command(subcommand)]
        action: TestcaseAction,
    },

    /// 交互快照管理
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// 动作命令工具
    Action {
        #[command(subcommand)]
        action: ActionAction,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// 测试用例名称（不含 .txt）
    pub testcase: String,

    /// 测试用例目录
    #[arg(long)]
    pub testcase_dir: Option<PathBuf>,

    /// 快照缓存文件
    #[arg(long)]
    pub snapshot_path: Option<PathBuf>,

    /// 依赖或用例失败时立即中止
    #[arg(long, overrides_with = "no_fail_fast")]
    pub fail_fast: bool,

    /// 依赖失败时继续运行并把依赖方记为 SKIPPED
    #[arg(long, overrides_with = "fail_fast")]
    pub no_fail_fast: bool,

    /// 动作失败后由操作员决定是否继续
    #[arg(long)]
    pub interactive: bool,

    /// 每个动作最多修复次数
    #[arg(long)]
    pub max_heal_attempts: Option<u32>,

    /// 运行汇总输出文件 (.json/.yaml)
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum TestcaseAction {
    /// 列出测试用例
    List {
        /// 测试用例目录
        #[arg(long)]
        testcase_dir: Option<PathBuf>,
    },
    /// 显示测试用例的解析结果
    Show {
        /// 测试用例名称
        name: String,

        /// 测试用例目录
        #[arg(long)]
        testcase_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// 列出缓存的操作配方
    List {
        /// 快照缓存文件
        #[arg(long)]
        snapshot_path: Option<PathBuf>,
    },
    /// 显示某个步骤的配方
    Show {
        /// 步骤文本
        step: String,

        /// 快照缓存文件
        #[arg(long)]
        snapshot_path: Option<PathBuf>,
    },
    /// 删除某个步骤的配方，下次执行时重新分析
    Remove {
        /// 步骤文本
        step: String,

        /// 快照缓存文件
        #[arg(long)]
        snapshot_path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ActionAction {
    /// 解析动作命令并输出结构化动作
    Parse {
        /// 动作命令，如 ssh_run("uptime")
        command: String,

        /// 输出格式 (text/json/yaml)
        #[arg(short = 'f', long, default_value = "text")]
        format: String,
    },
}

fn init_tracing(level: &str) {
    // RUST_LOG 优先
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return;
    }

    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    debug!("ATP CLI 启动");

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => commands::run::handle(args, config).await?,
        Commands::Testcase { action } => commands::testcase::handle(action, config)?,
        Commands::Snapshot { action } => commands::snapshot::handle(action, config)?,
        Commands::Action { action } => commands::action::handle(action)?,
    }

    Ok(())
}
