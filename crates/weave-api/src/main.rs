//! Weave CLI and REST API entry point.
//!
//! Binary name: `weave`
//!
//! Parses CLI arguments, initializes the execution store and scheduler,
//! then dispatches to the appropriate command handler or starts the
//! REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ListResource};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,weave=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "weave", &mut std::io::stdout());
        return Ok(());
    }

    // Validation is offline, no store needed
    if let Commands::Validate { file } = &cli.command {
        return cli::workflow::validate_workflow(file, cli.json).await;
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Serve { port, host } => {
            serve(state, &host, port).await?;
        }

        Commands::Run { name, payload } => {
            cli::instance::run_workflow(&state, &name, payload.as_deref(), cli.json).await?;
        }

        Commands::List { resource } => match resource {
            ListResource::Workflows => {
                cli::workflow::list_workflows(&state, cli.json).await?;
            }
            ListResource::Instances { workflow, limit } => {
                cli::instance::list_instances(&state, workflow.as_deref(), limit, cli.json)
                    .await?;
            }
        },

        Commands::Show { id } => {
            cli::instance::show_instance(&state, &id, cli.json).await?;
        }

        Commands::Cancel { id } => {
            cli::instance::cancel_instance(&state, &id, cli.json).await?;
        }

        Commands::Register { file } => {
            cli::workflow::register_workflow(&state, &file, cli.json).await?;
        }

        Commands::Validate { .. } | Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    state.recover_and_start_triggers().await?;

    let app = http::router::build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("listening on http://{addr}");
    println!("weave v{} listening on http://{addr}", env!("CARGO_PKG_VERSION"));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
