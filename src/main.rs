use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use fluux_tasks::config::ReplayConfig;
use fluux_tasks::replay::Session;

fn print_help() {
    eprintln!("fluux-tasks v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!();
    eprintln!("Replay a recorded XMPP stream against a set of IQ requests and report");
    eprintln!("how each request finished, one JSON object per line.");
    eprintln!();
    eprintln!("Usage: fluux-tasks --jid=JID [OPTIONS] [< transcript.xml]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID         Our own full JID (required)");
    eprintln!("      --server=JID      Server JID (default: domain of --jid)");
    eprintln!("      --base-ns=NS      Stream namespace (default: jabber:client)");
    eprintln!("      --get=TO,NS       Send <iq type='get'> with a <query xmlns=NS/> to TO");
    eprintln!("      --set=TO,NS       Same, with type='set'. TO may be empty");
    eprintln!("      --transcript=PATH Read the inbound stream from PATH (default: stdin)");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr");
    eprintln!("      --verbose=xmpp    Enable verbose logging including stanza content");
    eprintln!("      --log-file=PATH   Also write logs to a daily-rotating file");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("End of input, a stream error or </stream:stream> counts as a disconnect:");
    eprintln!("requests still waiting fail with status code 0 (\"Disconnected\").");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
    eprintln!();
    eprintln!("Exit status is 0 when every request succeeded, 1 otherwise.");
}

fn init_logging(config: &ReplayConfig) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let rust_log = std::env::var("RUST_LOG").is_ok();

    // File layer: only with --log-file, daily-rotating, non-blocking writes
    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fluux-tasks.log".to_string());

            if let Err(e) = std::fs::create_dir_all(&dir) {
                eprintln!("Warning: could not create log directory '{}': {}", dir.display(), e);
            }

            let file_filter = if rust_log {
                EnvFilter::from_default_env()
            } else {
                EnvFilter::new("fluux_tasks=debug,info")
            };
            let file_appender = tracing_appender::rolling::daily(&dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Stderr layer: only when --verbose or RUST_LOG is set
    let stderr_layer = if config.verbose() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if config.verbose_level.as_deref() == Some("xmpp") {
            EnvFilter::new("fluux_tasks=debug,info")
        } else {
            EnvFilter::new("fluux_tasks=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The background writer must live until process exit.
    if let Some(guard) = guard {
        std::mem::forget(guard);
    }
}

fn run(config: &ReplayConfig) -> fluux_tasks::Result<bool> {
    let mut session = Session::new(config);
    for spec in &config.requests {
        session.request(spec)?;
    }
    tracing::info!(
        jid = %config.jid,
        server = %config.server,
        requests = config.requests.len(),
        "replaying transcript"
    );

    let mut input: Box<dyn Read> = match &config.transcript {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(std::io::stdin().lock()),
    };

    let mut chunk = [0u8; 4096];
    while !session.is_closed() {
        let n = input.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        session.feed(&chunk[..n])?;
    }
    session.disconnect();

    let mut out = std::io::stdout().lock();
    for report in session.reports() {
        writeln!(out, "{}", serde_json::to_string(&report)?)?;
    }
    Ok(session.all_succeeded())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match ReplayConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'fluux-tasks --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if config.help {
        print_help();
        return ExitCode::SUCCESS;
    }

    init_logging(&config);

    match run(&config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "replay failed");
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}
