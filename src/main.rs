use std::io::BufRead;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use releasehook::config::{HookConfig, Overrides, default_config_path};
use releasehook::git::repository_exists;
use releasehook::pipeline::{self, PipelineContext, RunOutcome};
use releasehook::process::SystemRunner;
use releasehook::report::ConsoleReporter;
use releasehook::types::PushEvent;

/// Exit status for usage and configuration errors.
const EXIT_USAGE: i32 = 3;

#[derive(Parser)]
#[command(
    name = "releasehook",
    about = "Deploy pushed commits from git hooks with atomic cutover"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding releases, storage and the dependency cache
    #[arg(long, global = true)]
    build_root: Option<PathBuf>,

    /// Bare repository the hook runs in (defaults to $GIT_DIR)
    #[arg(long, global = true)]
    git_dir: Option<PathBuf>,

    /// Branch whose pushes are deployed
    #[arg(long, global = true)]
    branch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate pushed refs read from stdin; reject the push on failure
    PreReceive,

    /// Deploy pushed refs read from stdin
    PostReceive,

    /// Deploy a single push event
    Deploy {
        /// Previous commit id of the ref
        old: String,
        /// Pushed commit id
        new: String,
        /// Full ref name, e.g. refs/heads/master
        #[arg(value_name = "REF")]
        ref_name: String,
    },

    /// Check dependencies and configuration
    Doctor,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::PreReceive => cmd_hook(&cli.global, HookMode::Validate),
        Commands::PostReceive => cmd_hook(&cli.global, HookMode::Deploy),
        Commands::Deploy { old, new, ref_name } => cmd_deploy(&cli.global, &old, &new, &ref_name),
        Commands::Doctor => cmd_doctor(&cli.global),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_USAGE);
        }
    }
}

#[derive(Clone, Copy)]
enum HookMode {
    Validate,
    Deploy,
}

fn load_config(global: &GlobalArgs) -> Result<HookConfig, Box<dyn std::error::Error>> {
    let path = match &global.config {
        Some(path) => Some(path.clone()),
        None => default_config_path().filter(|p| p.is_file()),
    };
    if let Some(path) = &path {
        log::debug!("loading configuration from {}", path.display());
    }

    let overrides = Overrides {
        build_root: global.build_root.clone(),
        git_dir: global.git_dir.clone(),
        branch: global.branch.clone(),
    };
    Ok(HookConfig::load(path.as_deref(), overrides)?)
}

fn handle(config: &HookConfig, event: &PushEvent, mode: HookMode) -> RunOutcome {
    let runner = SystemRunner::new();
    let reporter = ConsoleReporter::new();
    let ctx = PipelineContext::new(event, config, &runner, &reporter);
    match mode {
        HookMode::Validate => pipeline::validate(&ctx),
        HookMode::Deploy => pipeline::run(&ctx),
    }
}

/// Git feeds one `<old> <new> <ref>` line per updated ref.
fn cmd_hook(global: &GlobalArgs, mode: HookMode) -> Result<i32, Box<dyn std::error::Error>> {
    let config = load_config(global)?;

    let mut events = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: PushEvent = line
            .parse()
            .map_err(|e| format!("Invalid hook input '{}': {}", line.trim(), e))?;
        events.push(event);
    }

    let mut code = 0;
    for event in &events {
        let outcome = handle(&config, event, mode);
        log::info!("{} finished with exit code {}", event, outcome.exit_code());
        code = code.max(outcome.exit_code());
    }
    Ok(code)
}

fn cmd_deploy(
    global: &GlobalArgs,
    old: &str,
    new: &str,
    ref_name: &str,
) -> Result<i32, Box<dyn std::error::Error>> {
    let config = load_config(global)?;
    let event: PushEvent = format!("{old} {new} {ref_name}")
        .parse()
        .map_err(|e| format!("Invalid push event: {}", e))?;

    Ok(handle(&config, &event, HookMode::Deploy).exit_code())
}

fn cmd_doctor(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    println!("releasehook System Check\n");

    let git_ok = std::process::Command::new("git")
        .args(["--version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        if git_ok { "available" } else { "not found" }
    );

    let config = match load_config(global) {
        Ok(config) => {
            println!("[OK] Config: loaded");
            config
        }
        Err(e) => {
            println!("[FAIL] Config: {}", e);
            return Ok(1);
        }
    };

    let repo_ok = repository_exists(&config.git_dir);
    println!(
        "[{}] Repository: {}",
        if repo_ok { "OK" } else { "FAIL" },
        config.git_dir.display()
    );

    let root_ok = match std::fs::metadata(&config.build_root) {
        Ok(meta) => meta.is_dir(),
        // First deploy creates it as long as some ancestor exists
        Err(_) => config.build_root.ancestors().skip(1).any(|p| p.is_dir()),
    };
    println!(
        "[{}] Build root: {}",
        if root_ok { "OK" } else { "FAIL" },
        config.build_root.display()
    );

    let tool = config.dependency.command.first().cloned().unwrap_or_default();
    let tool_ok = std::process::Command::new(&tool)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    println!(
        "[{}] Dependency tool: {}",
        if tool_ok { "OK" } else { "INFO" },
        if tool_ok {
            tool
        } else {
            format!("{} not found (only needed for projects with dependencies)", tool)
        }
    );

    println!(
        "[INFO] Restart command: {}",
        config
            .restart_command
            .as_ref()
            .map(|c| c.join(" "))
            .unwrap_or_else(|| "not configured".to_string())
    );

    if !git_ok || !repo_ok || !root_ok {
        return Ok(1);
    }
    Ok(0)
}
