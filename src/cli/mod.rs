pub mod jobs;
pub mod migrate;
pub mod serve;
pub mod webhook;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(version)]
#[command(about = "Webhook delivery and tenant rate limiting for FaceGate", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "facegate.toml", env = "FACEGATE_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP surface, delivery worker, limiter sweep and event dispatcher
    Serve {
        #[arg(short = 'H', long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply pending database migrations
    Migrate,
    /// Manage webhook subscriptions
    Webhook {
        #[command(subcommand)]
        command: WebhookCommand,
    },
    /// Inspect and prune delivery jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Subcommand)]
pub enum WebhookCommand {
    Add {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// Comma-separated event types
        #[arg(long, value_delimiter = ',', required = true)]
        events: Vec<String>,
    },
    List {
        #[arg(long)]
        tenant: Uuid,
    },
    Enable {
        id: Uuid,
    },
    Disable {
        id: Uuid,
    },
    /// Issue a new signing secret
    RotateSecret {
        id: Uuid,
    },
    Remove {
        id: Uuid,
    },
}

#[derive(Subcommand)]
pub enum JobsCommand {
    List {
        /// pending, delivered or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Delete delivered and failed jobs older than the given age
    Prune {
        #[arg(long)]
        older_than_days: u32,
    },
}
