//! Chips Testkit 命令行入口
//!
//! 在测试之外检查声明与运行时装配结果。
//!
//! # 命令概览
//!
//! - `plan` - 解析计划文件并输出安装计划
//! - `report` - 按计划文件装配运行时并输出拓扑，存在错误时以非零状态退出
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 输出解析后的安装计划
//! chips-testkit plan tests/plans/impl-test.yaml
//!
//! # 指定配置文件与搜索路径装配运行时
//! chips-testkit -c testkit.yaml report tests/plans/impl-test.yaml -p target/modules
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

use chips_testkit::module::diagnostics;
use chips_testkit::{
    DescriptorResolver, HarnessConfig, Logger, LoggerConfig, PlanFile, TestHarness,
};

/// Chips Testkit - 模块化运行时测试套件
#[derive(Parser)]
#[command(name = "chips-testkit")]
#[command(version, about = "为测试装配隔离的模块化运行时", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "testkit.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 子命令
    #[command(subcommand)]
    command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 输出安装计划
    ///
    /// 解析计划文件中的声明（含继承与组合声明），以 YAML 输出安装计划、属性和导出包。
    Plan {
        /// 计划文件（YAML 或 JSON）
        file: PathBuf,
    },

    /// 装配运行时并输出拓扑
    ///
    /// 按计划文件创建运行时，输出模块、组件和能力报告，然后检查运行时是否无错误。
    Report {
        /// 计划文件（YAML 或 JSON）
        file: PathBuf,

        /// 追加的模块搜索路径
        #[arg(short = 'p', long = "search-path")]
        search_path: Vec<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

async fn load_config(path: &Path) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(HarnessConfig::from_file(path).await?)
    } else {
        Ok(HarnessConfig::default())
    }
}

async fn show_plan(plan_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let plan = PlanFile::from_file(plan_path).await?;
    let resolved = DescriptorResolver::with_composites(plan.composite_registry()).resolve(&plan.scope);

    println!("# scope: {}", plan.scope.name);
    print!("{}", serde_yaml::to_string(&resolved)?);
    for problem in &resolved.problems {
        eprintln!("警告: {}", problem);
    }
    Ok(())
}

async fn run_report(
    config: HarnessConfig,
    plan_path: &Path,
) -> Result<bool, Box<dyn std::error::Error>> {
    let plan = PlanFile::from_file(plan_path).await?;
    let harness = TestHarness::new(config).with_composites(plan.composites.clone());

    let runtime = harness.before_all(&plan.scope).await?;
    info!(scope = %plan.scope.name, "运行时已装配");

    let mut sink = |line: String| println!("{}", line);
    diagnostics::print_framework_state(runtime.framework().as_ref(), &mut sink).await;

    let outcome = diagnostics::assert_error_free(runtime.framework().as_ref()).await;
    harness.after_all(&plan.scope).await;

    match outcome {
        Ok(()) => Ok(true),
        Err(e) => {
            error!(error_code = e.error_code(), "{}", e);
            eprintln!("{}", e);
            Ok(false)
        }
    }
}

fn print_version() {
    println!("Chips Testkit {}", chips_testkit::VERSION);
    println!("  目标平台: {}", std::env::consts::ARCH);
    println!("  操作系统: {}", std::env::consts::OS);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置加载失败: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _log_guard = match cli.command {
        Commands::Version => None,
        _ => Some(Logger::try_init(LoggerConfig::from_log_config(&config.logging))),
    };

    let result = match cli.command {
        Commands::Plan { file } => show_plan(&file).await.map(|_| true),
        Commands::Report { file, search_path } => {
            config.search_path.extend(search_path);
            run_report(config, &file).await
        }
        Commands::Version => {
            print_version();
            Ok(true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("错误: {}", e);
            ExitCode::FAILURE
        }
    }
}
