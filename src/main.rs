//! QuickPDF command line harness
//!
//! Opens a document through the same pipeline the viewer uses, optionally
//! unlocks it, and writes rendered pages out as PNG files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quickpdf_render::backend::MuPdfBackend;
use quickpdf_render::{
    DocumentSession, FitMode, Opened, PipelineConfig, PipelineError, SessionOptions, Viewport,
};

/// Render pages of a PDF the way the viewer would
#[derive(Parser)]
#[command(name = "quickpdf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path or file:// reference to the document
    reference: String,

    /// Password for encrypted documents
    #[arg(short, long)]
    password: Option<String>,

    /// Viewport width in pixels
    #[arg(long, default_value_t = 1080)]
    width: u32,

    /// Viewport height in pixels
    #[arg(long, default_value_t = 1920)]
    height: u32,

    /// fit-width, fit-page or original-size
    #[arg(long, default_value = "fit-width")]
    fit: FitMode,

    /// First page to render (0-indexed)
    #[arg(long, default_value_t = 0)]
    first: i64,

    /// Number of pages to render
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Directory for rendered PNGs
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Print document info as JSON and exit
    #[arg(long)]
    info: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "quickpdf_render=info,quickpdf=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = SessionOptions::new(PipelineConfig::from_env())
        .with_view(cli.fit, Viewport::new(cli.width, cli.height));
    let backend = Arc::new(MuPdfBackend::new());

    let session = match open(backend, &cli, options).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!("Open failed: {}", e);
            anyhow::bail!("{}", e.user_message());
        }
    };

    if cli.info {
        println!("{}", serde_json::to_string_pretty(&session.info())?);
        session.close();
        return Ok(());
    }

    std::fs::create_dir_all(&cli.out)
        .with_context(|| format!("Failed to create {}", cli.out.display()))?;

    let last = cli.first.saturating_add(cli.count as i64);
    for index in cli.first..last {
        let page = match session.page_at(index).await {
            Ok(page) => page,
            Err(e @ PipelineError::OutOfRange { .. }) => {
                tracing::warn!("{}", e);
                break;
            }
            Err(e) if e.is_page_local() => {
                eprintln!("Page {}: {}", index + 1, e.user_message());
                continue;
            }
            Err(e) => anyhow::bail!("{}", e.user_message()),
        };

        let target = cli.out.join(format!("page-{:04}.png", index + 1));
        page.image()
            .save(&target)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        println!("{} ({}x{})", target.display(), page.width(), page.height());
    }

    let stats = session.cache_stats();
    tracing::info!(
        "Cache: {} pages, {} of {} bytes, {} hits, {} misses",
        stats.entries,
        stats.used_bytes,
        stats.capacity_bytes,
        stats.hits,
        stats.misses
    );
    session.close();
    Ok(())
}

async fn open(
    backend: Arc<MuPdfBackend>,
    cli: &Cli,
    options: SessionOptions,
) -> quickpdf_render::Result<DocumentSession<MuPdfBackend>> {
    match DocumentSession::open(backend, &cli.reference, options).await? {
        Opened::Ready(session) => Ok(session),
        Opened::Locked(mut locked) => {
            let password = cli.password.as_deref().ok_or(PipelineError::PasswordRequired)?;
            tracing::info!("{} is encrypted, trying supplied password", locked.name());
            locked.unlock(password).await
        }
    }
}
