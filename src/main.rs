use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use session_stats::aggregator::{AggregatorSettings, GlobalStatsAggregator};
use session_stats::cache::{FileCache, MemoryCache};
use session_stats::config::{self, Config};
use session_stats::discovery;
use session_stats::stats::GeneratorOptions;
use session_stats::telemetry::{self, SharedTelemetry};
use session_stats::types::{GlobalSummary, ProjectRef, ProjectStatistics};
use session_stats::utils::{self, NumberFormatOptions};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "session-stats")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding one log directory per project (defaults to ~/.claude/projects)
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    /// Pretty-print JSON instead of a single line
    #[arg(long, global = true, default_value_t = false)]
    pretty: bool,

    /// Print a short text summary instead of JSON
    #[arg(long, global = true, default_value_t = false)]
    summary: bool,

    /// Use human-readable number formatting (k, m, b, t) in summaries
    #[arg(short = 'H', long, global = true, default_value_t = false)]
    number_human: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Usage across every project
    Global,
    /// Statistics for one project (directory name, display name or path)
    Project { project: String },
    /// Statistics for a configured rollup
    Rollup { name: String },
    /// Process projects that have no cached statistics yet
    Warm(WarmArgs),
    /// Manage configuration
    Config(ConfigArgs),
    /// Delete the on-disk statistics cache
    ClearCache,
}

#[derive(Args)]
struct WarmArgs {
    /// Maximum number of projects to process (defaults to all)
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (cache-max-projects, cache-max-mb-per-project, cache-dir,
        /// cache-read-multiplier, cache-write-multiplier, warm-on-startup,
        /// background-processing, log-level, number-comma)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Group every project under a directory into a named rollup
    RollupAdd { name: String, path: PathBuf },
    /// Remove a rollup
    RollupRemove { name: String },
}

/// Everything a stats command needs, built once from the effective config.
struct App {
    config: Config,
    projects: Vec<ProjectRef>,
    aggregator: GlobalStatsAggregator,
    format_options: NumberFormatOptions,
}

impl App {
    fn build(cli: &Cli, config: Config, telemetry: SharedTelemetry) -> Result<Self> {
        let projects_root = match &cli.projects_dir {
            Some(dir) => dir.clone(),
            None => discovery::claude_projects_dir().context("Could not find home directory")?,
        };

        let memory = Arc::new(MemoryCache::new(config.memory_limits(), telemetry.clone()));
        let file = Arc::new(FileCache::new(config.cache_root()?, telemetry.clone()));
        let settings = AggregatorSettings {
            generator: GeneratorOptions {
                utc_offset: utils::local_utc_offset(),
                cache_pricing: config.cache_pricing(),
            },
            window_days: config.processing.max_date_range_days,
        };

        let mut projects = discovery::discover_projects(&projects_root)?;
        discovery::mark_in_cache(&mut projects, &memory);

        let mut format_options = config.format_options();
        format_options.use_human |= cli.number_human;

        Ok(Self {
            aggregator: GlobalStatsAggregator::new(memory, file, settings, telemetry),
            config,
            projects,
            format_options,
        })
    }

    /// Backfills a few uncached projects before aggregating, as configured.
    async fn warm(&self, projects: &[ProjectRef]) {
        if self.config.processing.enable_background && self.config.processing.warm_on_startup > 0 {
            self.aggregator
                .process_uncached_projects(projects, self.config.processing.warm_on_startup)
                .await;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_effective() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e:#}");
            std::process::exit(1);
        }
    };
    telemetry::init_subscriber(&config.logging.level);

    let result = match &cli.command {
        Commands::Config(config_args) => handle_config_subcommand(config_args),
        Commands::ClearCache => clear_cache(&config),
        Commands::Global => run_global(&cli, config).await,
        Commands::Project { project } => run_project(&cli, config, project).await,
        Commands::Rollup { name } => run_rollup(&cli, config, name).await,
        Commands::Warm(args) => run_warm(&cli, config, args.limit).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_global(cli: &Cli, config: Config) -> Result<()> {
    let app = App::build(cli, config, telemetry::tracing())?;
    app.warm(&app.projects).await;

    let summary = app.aggregator.get_global_stats(&app.projects).await;
    if cli.summary {
        print_global_summary(&summary, &app.format_options);
        Ok(())
    } else {
        print_json(&summary, cli.pretty)
    }
}

async fn run_project(cli: &Cli, config: Config, needle: &str) -> Result<()> {
    let app = App::build(cli, config, telemetry::tracing())?;
    let project = resolve_project(&app.projects, needle)?;

    let stats = match app.aggregator.project_stats(&project) {
        Some(stats) => stats,
        None => {
            app.aggregator
                .process_uncached_projects(std::slice::from_ref(&project), 1)
                .await;
            app.aggregator
                .project_stats(&project)
                .with_context(|| format!("Could not process {}", project.log_path.display()))?
        }
    };
    output_stats(&stats, cli, &app.format_options)
}

async fn run_rollup(cli: &Cli, config: Config, name: &str) -> Result<()> {
    let app = App::build(cli, config, telemetry::tracing())?;
    let path = app
        .config
        .rollup_path(name)
        .with_context(|| format!("Unknown rollup '{name}'"))?;

    let children = discovery::rollup_children(&app.projects, path);
    app.warm(&children).await;
    let stats = app.aggregator.get_rollup_stats(name, &children).await;
    output_stats(&stats, cli, &app.format_options)
}

async fn run_warm(cli: &Cli, config: Config, limit: Option<usize>) -> Result<()> {
    let app = App::build(cli, config, telemetry::tracing())?;
    let limit = limit.unwrap_or(app.projects.len());

    let processed = app
        .aggregator
        .process_uncached_projects(&app.projects, limit)
        .await;
    println!("Processed {processed} of {} projects", app.projects.len());
    Ok(())
}

fn resolve_project(projects: &[ProjectRef], needle: &str) -> Result<ProjectRef> {
    if let Some(project) = discovery::find_project(projects, needle) {
        return Ok(project.clone());
    }

    let path = PathBuf::from(needle);
    if path.is_dir() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| needle.to_string());
        return Ok(ProjectRef::new(name, path));
    }

    anyhow::bail!("No project matching '{needle}'")
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        simd_json::to_string_pretty(value)?
    } else {
        simd_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

fn output_stats(stats: &ProjectStatistics, cli: &Cli, options: &NumberFormatOptions) -> Result<()> {
    if cli.summary {
        print_project_summary(stats, options);
        Ok(())
    } else {
        print_json(stats, cli.pretty)
    }
}

fn print_global_summary(summary: &GlobalSummary, options: &NumberFormatOptions) {
    let n = |v: u64| utils::format_number(v, options);

    println!(
        "📊 {} projects ({} with stats)",
        summary.total_projects, summary.projects_with_stats
    );
    if let (Some(first), Some(last)) = (&summary.first_use_date, &summary.last_use_date) {
        println!("   Active: {first} → {last}");
    }
    println!("   Commands: {}", n(summary.total_commands));
    println!(
        "   Tokens: {} in / {} out / {} cache read / {} cache write",
        n(summary.total_input_tokens),
        n(summary.total_output_tokens),
        n(summary.total_cache_read_tokens),
        n(summary.total_cache_write_tokens)
    );
    println!("   Cost: ${:.2}", summary.total_cost);

    let window_cost: f64 = summary.daily_costs.iter().map(|d| d.cost).sum();
    println!(
        "   Last {} days: ${:.2}",
        summary.daily_costs.len(),
        window_cost
    );
}

fn print_project_summary(stats: &ProjectStatistics, options: &NumberFormatOptions) {
    let n = |v: u64| utils::format_number(v, options);
    let overview = &stats.overview;
    let ui = &stats.user_interactions;

    match &stats.rollup_name {
        Some(name) => println!(
            "📦 Rollup {name} ({} projects)",
            stats.child_project_count.unwrap_or(0)
        ),
        None => println!("📁 {}", overview.project_name),
    }
    println!(
        "   Messages: {} across {} sessions",
        n(overview.total_messages),
        n(overview.sessions)
    );
    println!(
        "   Tokens: {} in / {} out",
        n(overview.total_tokens.input),
        n(overview.total_tokens.output)
    );
    println!("   Cost: ${:.2}", overview.total_cost);
    println!(
        "   Commands: {} ({}% needed tools, {}% interrupted)",
        n(ui.user_commands_analyzed),
        ui.percentage_requiring_tools,
        ui.interruption_rate
    );
    println!(
        "   Steps: avg {} / max {} over {} sequences",
        ui.average_step_length,
        ui.max_step_length,
        ui.step_sequences.len()
    );
    println!(
        "   Errors: {} ({:.2}% of messages)",
        n(stats.errors.total),
        stats.errors.rate * 100.0
    );
    println!(
        "   Cache: {}% hit rate, {}% efficiency",
        stats.cache.hit_rate, stats.cache.efficiency
    );
}

fn clear_cache(config: &Config) -> Result<()> {
    let file = FileCache::new(config.cache_root()?, telemetry::tracing());
    let freed = file.disk_usage();
    file.clear()?;
    println!(
        "🧹 Cleared {} ({} freed)",
        file.root().display(),
        utils::format_bytes(freed)
    );
    Ok(())
}

fn handle_config_subcommand(config_args: &ConfigArgs) -> Result<()> {
    match &config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            config::create_default_config(*overwrite).context("Error creating config")
        }
        ConfigSubcommands::Show => config::show_config().context("Error showing config"),
        ConfigSubcommands::Set { key, value } => {
            config::set_config_value(key, value).context("Error setting config")
        }
        ConfigSubcommands::RollupAdd { name, path } => {
            config::add_rollup(name, path).context("Error adding rollup")
        }
        ConfigSubcommands::RollupRemove { name } => {
            config::remove_rollup(name).context("Error removing rollup")
        }
    }
}
