use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ork_domain::config::{Config, WorkspaceLayout};
use ork_domain::session::SessionOutcome;
use ork_engine::TractionOpts;
use ork_gateway::cli::{resolve_workspace, Cli, Command};
use ork_gateway::state::AppState;
use ork_gateway::{api, bootstrap, import};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let workspace = resolve_workspace(cli.workspace.clone());

    match run_command(cli, &workspace).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("orket: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(cli: Cli, workspace: &Path) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Run {
            target,
            timeout,
            max_turns,
            dry_run,
        } => {
            init_tracing(workspace);
            let state = bootstrap::build_with(workspace, |config| {
                if let Some(secs) = timeout {
                    config.turn_timeout_secs = secs;
                }
            })?;
            let opts = TractionOpts { max_turns, dry_run };
            let summary = state.traction.run(&target, &opts).await?;

            if dry_run {
                println!("dispatch order: {}", summary.planned.join(", "));
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "session {} finished: {:?} after {} turn(s)",
                summary.session_id, summary.outcome, summary.turns
            );
            Ok(exit_for(&summary.outcome))
        }

        Command::Resume { session, max_turns } => {
            init_tracing(workspace);
            let state = bootstrap::build(workspace)?;
            let previous = state
                .ledger
                .get_session(&session)
                .with_context(|| format!("looking up session {session}"))?;
            tracing::info!(
                session_id = %session,
                target = %previous.target_card_id,
                "resuming target from ledger"
            );

            let opts = TractionOpts {
                max_turns,
                dry_run: false,
            };
            let summary = state.traction.run(&previous.target_card_id, &opts).await?;
            state.ledger.append_event(
                &summary.session_id,
                chrono::Utc::now(),
                "resumed_from",
                &serde_json::json!({"session_id": session}),
            )?;
            println!(
                "session {} finished: {:?} after {} turn(s)",
                summary.session_id, summary.outcome, summary.turns
            );
            Ok(exit_for(&summary.outcome))
        }

        Command::Serve { bind } => {
            init_tracing(workspace);
            let state = bootstrap::build(workspace)?;
            serve(state, bind).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Init => {
            init_workspace(workspace)?;
            println!("workspace initialized at {}", workspace.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Import { file } => {
            init_tracing(workspace);
            let state = bootstrap::build(workspace)?;
            let count = import::import_file(&state.store, &file)?;
            println!("imported {count} card(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_for(outcome: &SessionOutcome) -> ExitCode {
    match outcome {
        SessionOutcome::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}

/// Structured tracing: JSON lines to a workspace log file when the logs
/// directory exists, otherwise to stderr.
fn init_tracing(workspace: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ork_gateway=debug"));

    let logs = WorkspaceLayout::new(workspace).logs();
    let file = std::fs::create_dir_all(&logs)
        .ok()
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logs.join("orket.log"))
                .ok()
        });

    match file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .json()
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }
}

/// Scaffold the workspace: directories, default config, built-in assets.
fn init_workspace(workspace: &Path) -> anyhow::Result<()> {
    let layout = WorkspaceLayout::new(workspace);
    layout.ensure_dirs().context("creating workspace layout")?;

    let config_path = workspace.join("orket.json");
    if !config_path.exists() {
        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&Config::default())?,
        )?;
    }

    for role in bootstrap::builtin_roles() {
        let path = layout.roles().join(format!("{}.json", role.role_id));
        if !path.exists() {
            std::fs::write(&path, serde_json::to_string_pretty(&role)?)?;
        }
    }

    let dialect_path = layout.dialects().join("active.json");
    if !dialect_path.exists() {
        std::fs::write(
            &dialect_path,
            serde_json::to_string_pretty(&ork_domain::role::Dialect::plain_json())?,
        )?;
    }

    Ok(())
}

/// Bind the HTTP surface; shut down cleanly on ctrl-c, marking active
/// sessions interrupted.
async fn serve(state: AppState, bind: Option<String>) -> anyhow::Result<()> {
    let addr = bind.unwrap_or_else(|| {
        format!("{}:{}", state.config.server.host, state.config.server.port)
    });

    let app = api::router(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "orket listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown_state
                .registry
                .interrupt_all(&shutdown_state.ledger, chrono::Utc::now());
        })
        .await
        .context("axum server error")?;

    Ok(())
}
