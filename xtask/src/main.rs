use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "gattmsg 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Central,
    Peripheral,
}

impl Role {
    fn subcommand(self) -> &'static str {
        match self {
            Role::Central => "central",
            Role::Peripheral => "peripheral",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// 构建 CLI (release)
    Build,
    /// 以调试日志运行一端 (开发模式)
    Run {
        /// 运行的角色
        #[arg(value_enum)]
        role: Role,
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
        /// 日志输出文件 (默认 /tmp/gattmsg-<role>.log)
        #[arg(short = 'o', long)]
        log_file: Option<String>,
    },
    /// 设置 capabilities (免 sudo 扫描)
    SetupCaps,
    /// 格式检查 + clippy + 测试
    Ci,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR")
        .map(std::path::PathBuf::from)
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
    {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Run {
            role,
            log_level,
            log_file,
        } => run(&sh, role, &log_level, log_file)?,
        Commands::SetupCaps => setup_caps(&sh)?,
        Commands::Ci => ci(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建 gattmsg...");
    cmd!(sh, "cargo build --release -p gattmsg-cli").run()?;
    println!("✅ 构建完成: target/release/gattmsg");
    Ok(())
}

fn run(sh: &Shell, role: Role, log_level: &str, log_file: Option<String>) -> Result<()> {
    let name = role.subcommand();
    let log_file = log_file.unwrap_or_else(|| format!("/tmp/gattmsg-{name}.log"));

    println!("🚀 启动 {} (开发模式)...", name);
    println!("   日志级别: {}", log_level);
    println!("   日志文件: {}", log_file);
    println!();
    println!("💡 提示: 在另一个终端运行以下命令查看实时日志:");
    println!("   tail -f {}", log_file);
    println!();

    let rust_log = format!(
        "{level},gattmsg_core={level},bluer={level},btleplug=info",
        level = log_level
    );

    // 使用 shell 执行以支持重定向
    let command = format!(
        "RUST_LOG='{}' cargo run -p gattmsg-cli -- {} 2>> '{}'",
        rust_log, name, log_file
    );

    cmd!(sh, "bash -c {command}").run()?;

    println!();
    println!("📁 日志已保存到: {}", log_file);
    Ok(())
}

fn setup_caps(sh: &Shell) -> Result<()> {
    println!("🔐 设置 capabilities...");

    build(sh)?;

    // CAP_NET_ADMIN + CAP_NET_RAW: BLE 扫描和广播
    cmd!(
        sh,
        "sudo setcap 'cap_net_admin,cap_net_raw+eip' target/release/gattmsg"
    )
    .run()?;

    println!("✅ Capabilities 设置完成");
    Ok(())
}

fn ci(sh: &Shell) -> Result<()> {
    println!("🔎 格式检查...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;

    println!("🔎 运行 clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets").run()?;

    // 会话和编解码测试不需要蓝牙硬件
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;

    println!("✅ 检查通过");
    Ok(())
}
