//! CLI binary for unpdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServiceConfig` and runs the server or a one-shot command.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use unpdf::{PdfCache, PdfiumConverter, ServiceConfig};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the service on 0.0.0.0:8000 with a ./cache directory
  unpdf

  # Public domain used in links inside generated markdown
  unpdf serve --domain unpdf.it --bind 0.0.0.0:8080

  # Convert one PDF through the cache and print the markdown
  unpdf fetch arxiv.org/pdf/2301.00001v1.pdf

  # Force a fresh conversion
  unpdf fetch https://arxiv.org/pdf/2301.00001v1.pdf --refresh -o paper.md

  # Drop expired entries and crash leftovers
  unpdf evict --ttl-days 7

ENVIRONMENT VARIABLES:
  PDF2MD_CACHE_DIR           Cache root directory
  PDF2MD_CACHE_TTL_DAYS      Entry lifetime in days (0 = never expire)
  PDF2MD_MAX_PDF_SIZE_MB     Size ceiling for source PDFs
  PDF2MD_DOWNLOAD_TIMEOUT    Download budget in seconds
  PDF2MD_CONVERSION_TIMEOUT  Conversion budget in seconds
  PDF2MD_DOMAIN              Public domain for usage text and image links
  PDF2MD_BIND                Listen address
  PDF2MD_EVICTION_INTERVAL   Seconds between background eviction passes
  PDFIUM_LIB_PATH            Path to an existing libpdfium; skips auto-download
  RUST_LOG                   Overrides the log filter
"#;

/// Serve public PDFs as Markdown by URL rewrite.
#[derive(Parser, Debug)]
#[command(
    name = "unpdf",
    version,
    about = "Serve public PDFs as Markdown by URL rewrite, with a coalescing disk cache",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    service: ServiceArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Convert one PDF through the cache and print its markdown.
    Fetch {
        /// Source URL, with or without its scheme.
        url: String,
        /// Ignore any cached entry and convert again.
        #[arg(long)]
        refresh: bool,
        /// Write Markdown to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove expired entries and leftovers of interrupted writes.
    Evict,
    /// Print usage counters.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// Cache root directory.
    #[arg(long, global = true, env = "PDF2MD_CACHE_DIR", default_value = "./cache")]
    cache_dir: PathBuf,

    /// Days before a cached conversion expires (0 = never).
    #[arg(long, global = true, env = "PDF2MD_CACHE_TTL_DAYS", default_value_t = 30)]
    ttl_days: u32,

    /// Reject source PDFs larger than this many megabytes.
    #[arg(long, global = true, env = "PDF2MD_MAX_PDF_SIZE_MB", default_value_t = 50,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_pdf_size_mb: u64,

    /// Download timeout in seconds.
    #[arg(long, global = true, env = "PDF2MD_DOWNLOAD_TIMEOUT", default_value_t = 30)]
    download_timeout: u64,

    /// Conversion timeout in seconds.
    #[arg(long, global = true, env = "PDF2MD_CONVERSION_TIMEOUT", default_value_t = 120)]
    conversion_timeout: u64,

    /// Public domain used in usage text and image links.
    #[arg(long, global = true, env = "PDF2MD_DOMAIN", default_value = "localhost:8000")]
    domain: String,

    /// Listen address for `serve`.
    #[arg(long, global = true, env = "PDF2MD_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Seconds between background eviction passes.
    #[arg(long, global = true, env = "PDF2MD_EVICTION_INTERVAL", default_value_t = 3600)]
    eviction_interval: u64,
}

impl ServiceArgs {
    fn to_config(&self) -> Result<ServiceConfig> {
        ServiceConfig::builder()
            .cache_dir(&self.cache_dir)
            .ttl_days(self.ttl_days)
            .max_pdf_size_mb(self.max_pdf_size_mb)
            .download_timeout_secs(self.download_timeout)
            .conversion_timeout_secs(self.conversion_timeout)
            .domain(&self.domain)
            .bind(&self.bind)
            .eviction_interval_secs(self.eviction_interval)
            .build()
            .context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    // ── Logging setup ────────────────────────────────────────────────────
    // One-shot commands keep stdout for markdown and stderr quiet unless asked.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if matches!(command, Command::Serve) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = cli.service.to_config()?;

    if matches!(command, Command::Serve | Command::Fetch { .. }) {
        ensure_pdf_engine(cli.quiet)?;
    }

    let converter = Arc::new(PdfiumConverter::new(&config).context("Failed to build HTTP client")?);
    let cache = PdfCache::open(config, converter)
        .await
        .context("Failed to open cache")?;

    match command {
        Command::Serve => {
            cache.sweep().await.context("Startup sweep failed")?;
            unpdf::server::serve(cache).await.context("Server failed")?;
        }
        Command::Fetch {
            url,
            refresh,
            output,
        } => {
            fetch(&cache, &url, refresh, output, cli.quiet).await?;
            cache.flush_stats().await.context("Failed to save stats")?;
        }
        Command::Evict => {
            let (evicted, swept) = cache.maintain().await.context("Eviction failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} evicted {} expired entr{}, removed {} staging and {} stale generation dir(s)",
                    green("✓"),
                    evicted,
                    if evicted == 1 { "y" } else { "ies" },
                    swept.staging_removed,
                    swept.generations_removed,
                );
            }
        }
        Command::Stats { json } => {
            let stats = cache.stats().await.context("Failed to read stats")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "total_conversions": stats.total_conversions,
                        "total_reads": stats.total_reads,
                        "cached_pdfs": stats.cached_pdfs,
                    }))
                    .context("Failed to serialize stats")?
                );
            } else {
                println!("Conversions:  {}", stats.total_conversions);
                println!("Reads:        {}", stats.total_reads);
                println!("Cached PDFs:  {}", stats.cached_pdfs);
            }
        }
    }

    Ok(())
}

async fn fetch(
    cache: &PdfCache,
    url: &str,
    refresh: bool,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let spinner = (!quiet).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Fetching");
        bar.set_message(url.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let result = cache.fetch_path(url, refresh).await;
    if let Some(bar) = &spinner {
        bar.finish_and_clear();
    }

    let served = match result {
        Ok(served) => served,
        Err(failure) => {
            if !quiet {
                eprintln!("{} {} ({})", red("✗"), failure, failure.kind);
            }
            bail!("{} failed with HTTP {}", url, failure.status_code());
        }
    };

    match output {
        Some(path) => {
            tokio::fs::write(&path, served.markdown())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(served.markdown().as_bytes())
                .context("Failed to write to stdout")?;
        }
    }

    if !quiet {
        eprintln!(
            "{} {}  {}",
            green("✓"),
            served.source_url(),
            dim(&format!(
                "{} pages · {} · {} ms · key {}",
                served.page_count(),
                if served.cached { "cached" } else { "converted" },
                served.conversion_ms(),
                served.key(),
            )),
        );
    }
    Ok(())
}

/// Make sure the pdfium shared library is on disk before the first
/// conversion. Downloads it (~30 MB) on first run unless `PDFIUM_LIB_PATH`
/// points at an existing copy.
fn ensure_pdf_engine(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}
