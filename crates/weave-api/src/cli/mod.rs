//! CLI command definitions and dispatch for the `weave` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI follows a
//! verb-noun pattern (e.g., `weave list workflows`, `weave run deploy`).

pub mod instance;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and operate workflow automations.
#[derive(Parser)]
#[command(name = "weave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "3000", env = "WEAVE_PORT")]
        port: u16,

        /// Host address to bind.
        #[arg(long, default_value = "127.0.0.1", env = "WEAVE_HOST")]
        host: String,
    },

    /// Run a workflow by name and wait for it to finish.
    Run {
        /// Workflow name.
        name: String,

        /// JSON trigger payload (defaults to `{}`).
        #[arg(long)]
        payload: Option<String>,
    },

    /// List resources.
    #[command(alias = "ls")]
    List {
        #[command(subcommand)]
        resource: ListResource,
    },

    /// Show full state of an execution instance.
    Show {
        /// Instance id.
        id: String,
    },

    /// Cancel a running instance.
    Cancel {
        /// Instance id.
        id: String,
    },

    /// Validate a workflow definition file without registering it.
    Validate {
        /// Path to a YAML or JSON definition.
        file: String,
    },

    /// Register a workflow definition from a file.
    Register {
        /// Path to a YAML or JSON definition.
        file: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ListResource {
    /// List registered workflow definitions.
    Workflows,

    /// List execution instances, newest first.
    Instances {
        /// Filter by workflow name.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of instances to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}
