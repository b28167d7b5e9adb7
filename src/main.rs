use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Alfred: a hierarchical JSON state store with role-projected HTTP and
/// WebSocket read access.
#[derive(Parser)]
#[command(name = "alfred")]
struct Cli {
    /// Path to the store's backing JSON document.
    #[arg(short = 's', long = "store")]
    store: PathBuf,

    /// Run without attaching to a controlling terminal. Accepted for
    /// compatibility; this revision does not fork or detach.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    #[arg(trailing_var_arg = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    fmt().with_env_filter(filter).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return ExitCode::from(if e.use_stderr() { 2 } else { 0 });
        }
    };

    if !cli.extra.is_empty() {
        warn!("ignoring unexpected positional arguments: {:?}", cli.extra);
    }
    if cli.daemon {
        info!("daemon mode requested; running in the foreground regardless in this revision");
    }

    info!(store = %cli.store.display(), "Alfred starting");
    match alfred::service::run(cli.store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("setup failed: {e}");
            ExitCode::FAILURE
        }
    }
}
