//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use wikiharvest_core::{CrawlProgress, run_categories, run_classify, run_crawl};
use wikiharvest_shared::{
    AppConfig, ClassifyConfig, CrawlConfig, CrawlSummary, PageId, RunContext, SourceMode,
    init_config, load_config, load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// wikiharvest: mirror a MediaWiki and label every page.
#[derive(Parser)]
#[command(
    name = "wikiharvest",
    version,
    about = "Incrementally crawl a MediaWiki site and classify its pages.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.wikiharvest/wikiharvest.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch pages that are new or changed since the last crawl.
    Crawl {
        /// MediaWiki api.php endpoint.
        #[arg(long)]
        api_url: Option<String>,

        /// Directory for page documents.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Registry database path.
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Maximum simultaneous page fetches.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Pages per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Do not write the API call audit log.
        #[arg(long)]
        no_audit: bool,
    },

    /// List every category on the wiki.
    Categories {
        /// Print a JSON array instead of one name per line.
        #[arg(long)]
        json: bool,
    },

    /// Classify crawled pages.
    Classify {
        /// Page source: html (document files) or registry.
        #[arg(long)]
        source: Option<String>,

        /// Directory of page documents (html source).
        #[arg(long)]
        input: Option<PathBuf>,

        /// Ignore stored fingerprints and reclassify everything.
        #[arg(long)]
        full_rebuild: bool,

        /// Classify every page without consulting or updating state.
        #[arg(long)]
        no_incremental: bool,

        /// Confidence below which a page is queued for review.
        #[arg(long)]
        threshold: Option<f64>,

        /// Skip redirect pages.
        #[arg(long)]
        exclude_redirects: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Install the global subscriber. Logs go to stderr so `categories --json` stays pipeable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,wikiharvest={level}")));

    let builder = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.with_target(cli.verbose > 1).init(),
        LogFormat::Json => builder.json().with_current_span(true).init(),
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Crawl {
            api_url,
            output_dir,
            registry,
            concurrency,
            chunk_size,
            no_audit,
        } => {
            let mut crawl = CrawlConfig::from(&config);
            if let Some(url) = api_url {
                crawl.api_url = url;
            }
            if let Some(dir) = output_dir {
                crawl.output_dir = dir;
            }
            if let Some(path) = registry {
                crawl.registry_path = path;
            }
            if let Some(n) = concurrency {
                crawl.concurrency = n.max(1);
            }
            if let Some(n) = chunk_size {
                crawl.chunk_size = n.max(1);
            }
            if no_audit {
                crawl.audit_dir = None;
            }
            cmd_crawl(&crawl).await
        }
        Command::Categories { json } => cmd_categories(&CrawlConfig::from(&config), json).await,
        Command::Classify {
            source,
            input,
            full_rebuild,
            no_incremental,
            threshold,
            exclude_redirects,
        } => {
            let mut classify = ClassifyConfig::from(&config);
            if let Some(mode) = source {
                classify.source_mode = mode.parse::<SourceMode>()?;
            }
            if let Some(dir) = input {
                classify.input_dir = dir;
            }
            if let Some(t) = threshold {
                if !(0.0..=1.0).contains(&t) {
                    return Err(eyre!("threshold must be between 0 and 1, got {t}"));
                }
                classify.low_confidence_threshold = t;
            }
            classify.full_rebuild |= full_rebuild;
            if no_incremental {
                classify.incremental = false;
            }
            if exclude_redirects {
                classify.include_redirects = false;
            }
            cmd_classify(&classify).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_crawl(config: &CrawlConfig) -> Result<()> {
    let run = RunContext::new();
    info!(
        run_id = %run.run_id,
        api_url = %config.api_url,
        output_dir = %config.output_dir.display(),
        "starting crawl"
    );

    let reporter = CliProgress::new();
    let summary = run_crawl(config, &run, &reporter).await?;

    println!();
    println!("  Crawl finished.");
    println!("  Discovered: {}", summary.discovered_total);
    println!("  Queued:     {}", summary.queued_total);
    println!("  Saved:      {}", summary.processed_total);
    println!("  Failed:     {}", summary.failed_total);
    println!("  Unchanged:  {}", summary.skipped_total);
    println!();

    if summary.failed_total > 0 {
        return Err(eyre!(
            "{} of {} pages failed; re-run to retry them",
            summary.failed_total,
            summary.queued_total
        ));
    }
    Ok(())
}

async fn cmd_categories(config: &CrawlConfig, json: bool) -> Result<()> {
    let run = RunContext::new();
    let categories = run_categories(config, &run).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else {
        for name in &categories {
            println!("{name}");
        }
    }
    Ok(())
}

async fn cmd_classify(config: &ClassifyConfig) -> Result<()> {
    let run = RunContext::new();
    let report = run_classify(config, &run).await?;

    println!();
    println!("  Classification finished ({}).", report.source_mode);
    println!("  Discovered:  {}", report.total_discovered);
    println!("  Classified:  {}", report.classified_count);
    println!("  Unchanged:   {}", report.skipped_unchanged);
    println!("  Redirects:   {}", report.skipped_redirects);
    println!("  Load errors: {}", report.load_error_count);
    println!(
        "  Review:      misc={} low_conf={} conflicts={}",
        report.misc_count, report.low_conf_count, report.conflict_count
    );
    for (entity_type, count) in report.by_entity_type.iter().filter(|(_, n)| **n > 0) {
        println!("    {entity_type:<9} {count}");
    }
    println!("  Report:      {}", config.report_path.display());
    println!(
        "  Time:        {:.1}s",
        Duration::from_millis(report.duration_ms).as_secs_f64()
    );
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Crawl progress on an indicatif spinner that becomes a bar once the work set is known.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            bar.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.set_message("Discovering pages");
        Self { bar }
    }
}

impl CrawlProgress for CliProgress {
    fn discovered(&self, total: usize, queued: usize) {
        self.bar.set_length(queued as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
        {
            self.bar.set_style(style);
        }
        self.bar
            .set_message(format!("{queued} of {total} pages need fetching"));
    }

    fn page_done(&self, page_id: PageId, ok: bool) {
        self.bar.inc(1);
        if !ok {
            self.bar.set_message(format!("page {page_id} failed"));
        }
    }

    fn chunk_done(&self, index: usize, chunks: usize) {
        self.bar.set_message(format!("chunk {index}/{chunks}"));
    }

    fn done(&self, _summary: &CrawlSummary) {
        self.bar.finish_and_clear();
    }
}
