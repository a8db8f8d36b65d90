//! TUIDE CLI - language-server queries against the current directory.
//!
//! Each command loads the layered settings for the working directory, picks
//! the language server by file extension, runs one short session and shuts
//! the server down again:
//!
//! ```text
//! main() -> Settings::load(cwd) -> server_for_path(file) -> LspClient::start()
//!                                                               |
//!                                       hover | diagnostics <---+
//!                                                               |
//!                                              LspClient::shutdown(false)
//! ```

mod args;

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tuide_config::Settings;
use tuide_lsp::{DiagnosticsStore, LspClient, LspEvent, hover_text};

use crate::args::{Cli, Command};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Command output goes to stdout; without a log file, no logs at all.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tuide/logs/tuide.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".tuide").join("logs").join("tuide.log"));
    }

    // Fallback: ./.tuide/logs/tuide.log
    candidates.push(PathBuf::from(".tuide").join("logs").join("tuide.log"));

    candidates
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    let root = env::current_dir().context("resolving current directory")?;
    let settings = Settings::load(&root)?;

    match command {
        Command::Hover {
            file,
            line,
            character,
        } => hover(&settings, &file, line, character).await,
        Command::Diagnostics { file, wait_ms } => {
            diagnostics(&settings, &file, Duration::from_millis(wait_ms)).await
        }
        Command::Servers => servers(&settings),
    }
}

/// A started session for `file`, or `None` after reporting why it failed.
async fn start_session(
    settings: &Settings,
    file: &Path,
) -> Result<Option<(LspClient, mpsc::UnboundedReceiver<LspEvent>)>> {
    let Some(server) = settings.server_for_path(file)? else {
        bail!("no language server configured for {}", file.display());
    };
    let config = settings.client_config(&server.language)?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let client = LspClient::new(config, tx);
    if client.start().await {
        return Ok(Some((client, events)));
    }

    eprintln!("Failed to start {} language server", server.language);
    while let Ok(event) = events.try_recv() {
        if let LspEvent::Error { message, .. } | LspEvent::Stderr { line: message, .. } = event {
            eprintln!("  {message}");
        }
    }
    Ok(None)
}

fn read_document(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

async fn hover(settings: &Settings, file: &Path, line: u32, character: u32) -> Result<ExitCode> {
    let text = read_document(file)?;
    let Some((client, _events)) = start_session(settings, file).await? else {
        return Ok(ExitCode::FAILURE);
    };

    client.notify_did_open(file, &text).await;
    let hover = client.request_hover(file, line, character).await;
    client.shutdown(false).await;

    match hover {
        Some(hover) => println!("{}", hover_text(&hover)),
        None => println!("no hover"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn diagnostics(settings: &Settings, file: &Path, wait: Duration) -> Result<ExitCode> {
    let text = read_document(file)?;
    let Some((client, mut events)) = start_session(settings, file).await? else {
        return Ok(ExitCode::FAILURE);
    };

    client.notify_did_open(file, &text).await;

    let mut store = DiagnosticsStore::new();
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => {
                    store.apply(&event);
                }
                None => break,
            },
        }
    }
    client.shutdown(false).await;

    let snapshot = store.snapshot();
    for (path, items) in snapshot.files() {
        let shown = path.strip_prefix(settings.root()).unwrap_or(path);
        for diagnostic in items {
            println!("{}", diagnostic.display_with_path(shown));
        }
    }
    tracing::info!(
        files = snapshot.files().len(),
        total = snapshot.total_count(),
        errors = snapshot.error_count(),
        "diagnostics collected"
    );
    Ok(ExitCode::SUCCESS)
}

fn servers(settings: &Settings) -> Result<ExitCode> {
    for server in settings.servers()? {
        println!(
            "{:<12} {:<40} {}",
            server.language,
            server.command.join(" "),
            server.extensions.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}
