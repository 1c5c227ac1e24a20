use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

use testpulse::config::{FileConfig, Overrides, Settings};
use testpulse::{discovery, logging, tui};

#[derive(Parser)]
#[command(name = "testpulse")]
#[command(about = "Interactive Go test dashboard with live results and watch mode")]
#[command(version)]
struct Cli {
    /// Package patterns to test (default: ./...)
    packages: Vec<String>,

    /// Re-run tests when source files change
    #[arg(short, long)]
    watch: bool,

    /// Enable coverage
    #[arg(long)]
    cover: bool,

    /// Write a coverage profile (implies --cover)
    #[arg(long, value_name = "PATH")]
    cover_profile: Option<PathBuf>,

    /// Enable the race detector
    #[arg(long)]
    race: bool,

    /// Run tests in short mode
    #[arg(long)]
    short: bool,

    /// Per-package test timeout, Go syntax (default: 2m)
    #[arg(long, value_name = "DURATION")]
    timeout: Option<String>,

    /// Build tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Editor command (default: $EDITOR, then nvim)
    #[arg(long)]
    editor: Option<String>,

    /// Editor argument template with {file} and {line} (default: "+{line} {file}")
    #[arg(long, value_name = "TEMPLATE")]
    editor_args: Option<String>,

    /// Packages run at the same time
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Value passed to the test tool's -parallel flag
    #[arg(long, value_name = "N")]
    test_parallel: Option<usize>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Print discovered packages and tests, then exit
    #[arg(long)]
    list: bool,

    /// Path to config file (default: testpulse.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            watch: self.watch,
            cover: self.cover,
            cover_profile: self.cover_profile.clone(),
            race: self.race,
            short: self.short,
            timeout: self.timeout.clone(),
            tags: self.tags.clone(),
            editor: self.editor.clone(),
            editor_args: self.editor_args.clone(),
            parallel: self.parallel,
            test_parallel: self.test_parallel,
            debug: self.debug,
            packages: self.packages.clone(),
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let work_dir = std::env::current_dir().context("Could not determine working directory")?;

    let file = FileConfig::discover(&work_dir, cli.config.as_deref())?;
    let settings = Settings::resolve(
        &work_dir,
        file,
        cli.overrides(),
        std::env::var("EDITOR").ok(),
    )?;

    let _log = logging::init(settings.debug).context("Could not initialise logging")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    if cli.list {
        runtime.block_on(cmd_list(&settings))
    } else {
        runtime.block_on(tui::run_tui(settings))
    }
}

async fn cmd_list(settings: &Settings) -> Result<()> {
    let packages = discovery::discover(&settings.tool, &settings.work_dir, &settings.packages)
        .await
        .context("test discovery failed")?;

    if packages.is_empty() {
        println!("  {}", "No test packages found".dimmed());
        return Ok(());
    }

    for package in &packages {
        println!("{} {}", "📦".cyan(), package.import_path.bold());
        for test in &package.tests {
            println!("  {} {}", "•".green(), test);
        }
    }

    let tests: usize = packages.iter().map(|p| p.tests.len()).sum();
    println!(
        "\n{} packages, {} tests",
        packages.len().to_string().cyan(),
        tests.to_string().cyan()
    );
    Ok(())
}
