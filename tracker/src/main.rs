//! Visit Tracker - page visit tracking client.
//!
//! This binary simulates a page load and delivers the resulting tracking
//! requests to the tracking host.
//!
//! # Commands
//!
//! - `visit-tracker visit`: Automatic page-load tracking for a page
//! - `visit-tracker track`: Explicit tracking call with overrides and payload
//! - `visit-tracker query`: Print the encoded query without delivering it
//!
//! # Environment Variables
//!
//! See the [`config`](visit_tracker::config) module for available
//! configuration options.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use visit_tracker::config::TrackerConfig;
use visit_tracker::query::{self, PeData};
use visit_tracker::{
    AppendTarget, Completion, CompletionRegistry, Document, FetchingHead, Frame, Tracker,
    TrackingOverrides,
};

/// Time allowed for outstanding tracking fetches before exiting.
const FLUSH_TIMEOUT_SECS: u64 = 5;

/// Visit Tracker - page visit tracking client.
#[derive(Parser, Debug)]
#[command(name = "visit-tracker")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TRACKER_SITE_ID          Site identifier (default: 0, delivery disabled)
    TRACKER_DEBUG            Return elements instead of attaching them
    TRACKER_DYNAMIC_SITE     Skip automatic page-load tracking
    TRACKER_HOST             Tracking host (default: tr.prospecteye.com)
    TRACKER_INCLUDES_EXEMPT  Comma-separated site ids without includes script

EXAMPLES:
    # Track a page load
    export TRACKER_SITE_ID=a1b2c3
    visit-tracker visit --url https://www.example.com/ --title Home

    # Track a form submission from an embedded frame and wait for completion
    visit-tracker track --url https://forms.example.net/contact \\
        --parent-url https://www.example.com/contact \\
        --data '{\"type\":\"F\",\"email\":\"jo@example.com\"}' --wait
")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Track a page load the way the tracking snippet does.
    ///
    /// Skipped in debug mode and for dynamic sites.
    Visit(PageArgs),

    /// Track a page with explicit overrides.
    Track(TrackArgs),

    /// Print the encoded tracking query for a page.
    Query(QueryArgs),
}

/// The simulated page.
#[derive(Args, Debug)]
struct PageArgs {
    /// Address of the page.
    #[arg(long)]
    url: String,

    /// Page title.
    #[arg(long)]
    title: Option<String>,

    /// Referrer of the page.
    #[arg(long)]
    referrer: Option<String>,

    /// Visitor's browser refuses cookies.
    #[arg(long)]
    no_cookies: bool,

    /// Address of the page embedding this one in a frame.
    #[arg(long)]
    parent_url: Option<String>,

    /// Referrer of the embedding page.
    #[arg(long, requires = "parent_url")]
    parent_referrer: Option<String>,
}

#[derive(Args, Debug)]
struct TrackArgs {
    #[command(flatten)]
    page: PageArgs,

    #[command(flatten)]
    overrides: OverrideArgs,

    /// Delivery element.
    #[arg(long, value_enum, default_value_t = TargetArg::Script)]
    target: TargetArg,

    /// Build the element but do not attach it.
    #[arg(long)]
    no_append: bool,

    /// Wait for the completion report.
    #[arg(long)]
    wait: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[command(flatten)]
    page: PageArgs,

    #[command(flatten)]
    overrides: OverrideArgs,
}

#[derive(Args, Debug)]
struct OverrideArgs {
    /// Page name sent instead of the title.
    #[arg(long)]
    page_name: Option<String>,

    /// Site identifier sent instead of the configured one.
    #[arg(long)]
    site_id: Option<String>,

    /// Extra payload: a tagged string (e.g. `M42`) or a JSON object with a
    /// `type` field.
    #[arg(long)]
    data: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TargetArg {
    Script,
    Frame,
}

impl From<TargetArg> for AppendTarget {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Script => AppendTarget::Script,
            TargetArg::Frame => AppendTarget::Frame,
        }
    }
}

impl PageArgs {
    fn frame(&self) -> Frame {
        let mut document = Document::new(self.url.as_str())
            .with_referrer(self.referrer.clone().unwrap_or_default());
        if let Some(title) = &self.title {
            document = document.with_title(title.as_str());
        }

        match &self.parent_url {
            Some(parent_url) => {
                let parent = Document::new(parent_url.as_str())
                    .with_referrer(self.parent_referrer.clone().unwrap_or_default());
                let parent = Arc::new(Frame::new(parent).with_cookies(!self.no_cookies));
                Frame::child(&parent, document)
            }
            None => Frame::new(document).with_cookies(!self.no_cookies),
        }
    }
}

impl OverrideArgs {
    fn overrides(&self) -> TrackingOverrides {
        TrackingOverrides {
            page_name: self.page_name.clone(),
            site_id: self.site_id.clone(),
            extra_data: self.data.as_deref().map(parse_pe_data),
            ..TrackingOverrides::default()
        }
    }
}

/// Reads `--data` as JSON when possible, as a raw tagged string otherwise.
fn parse_pe_data(raw: &str) -> PeData {
    serde_json::from_str(raw)
        .ok()
        .and_then(|value| PeData::from_json(&value))
        .unwrap_or_else(|| PeData::Text(raw.to_string()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    let config = TrackerConfig::from_env().context("Failed to load configuration")?;

    info!(
        site_id = config.site_id.as_deref().unwrap_or("0"),
        host = %config.host,
        debug = config.debug,
        dynamic_site = config.dynamic_site,
        "Configuration loaded"
    );

    let registry = CompletionRegistry::new();
    let head = FetchingHead::new(Some(registry.clone())).context("Failed to create HTTP client")?;
    let tracker = Tracker::with_registry(config, head, registry)?;

    match command {
        Command::Visit(page) => {
            if !tracker.auto_track(&page.frame()) {
                info!("Automatic tracking disabled by configuration");
            }
        }
        Command::Track(args) => run_track(&tracker, args).await?,
        Command::Query(args) => {
            let request = tracker.resolve(&args.page.frame(), args.overrides.overrides());
            println!("{}", query::encode(&request));
        }
    }

    let abandoned = tracker
        .head()
        .flush(Duration::from_secs(FLUSH_TIMEOUT_SECS))
        .await;
    if abandoned > 0 {
        warn!(abandoned, "Some tracking fetches did not finish");
    }

    Ok(())
}

async fn run_track(tracker: &Tracker<FetchingHead>, args: TrackArgs) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let callback = args.wait.then(|| {
        Box::new(move |completion: Completion| {
            let _ = tx.send(completion);
        }) as visit_tracker::CompletionCallback
    });

    let element = tracker.track(
        &args.page.frame(),
        args.overrides.overrides(),
        args.target.into(),
        !args.no_append,
        callback,
    );

    if let Some(element) = element {
        println!(
            "{}",
            serde_json::to_string_pretty(&element).context("Failed to serialize element")?
        );
    }

    if args.wait && !args.no_append {
        let completion = rx.await.context("Completion callback was dropped")?;
        println!("completion: {:?} after {} polls", completion.status, completion.polls);
    }

    Ok(())
}

/// Initialize logging with tracing.
///
/// Uses `RUST_LOG` when set, `info` otherwise. Logs go to stderr so printed
/// queries and elements stay machine-readable.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
