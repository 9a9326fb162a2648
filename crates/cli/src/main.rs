// Depot CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: `watch` goes through depot_core::Listener so reconnect behavior matches library clients.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Depot CLI - Watch and publish live row changes")]
#[command(version)]
pub struct Cli {
    /// API base URL
    #[arg(long, env = "DEPOT_API_URL", default_value = "http://localhost:9000")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream live changes for one or more topics
    Watch {
        /// Topic to watch (repeatable): `table` or `table:column=op.value`
        #[arg(long = "topic", short, required = true)]
        topics: Vec<String>,

        /// Give up after this many consecutive failed connection attempts
        #[arg(long)]
        max_retries: Option<u32>,

        /// Delay before the first reconnect, in milliseconds
        #[arg(long, default_value = "1000")]
        initial_backoff_ms: u64,

        /// Also print heartbeat events
        #[arg(long)]
        show_heartbeats: bool,
    },

    /// Publish a row change (server must run without DATABASE_URL)
    Publish {
        /// Table the change belongs to
        table: String,

        /// Change type
        #[arg(long = "type", short = 't', value_parser = ["insert", "update", "delete"])]
        change_type: String,

        /// New row as a JSON object (insert/update)
        #[arg(long)]
        record: Option<String>,

        /// Previous row as a JSON object (update/delete)
        #[arg(long)]
        old_record: Option<String>,
    },

    /// Check server health
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Diagnostics go to stderr so event output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot_core=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = client::Client::new(&cli.api_url);
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Watch {
            topics,
            max_retries,
            initial_backoff_ms,
            show_heartbeats,
        } => {
            let options = commands::watch::WatchOptions {
                topics,
                max_retries,
                initial_backoff_ms,
                show_heartbeats,
            };
            commands::watch::run(&client, output_format, cli.quiet, options).await
        }
        Commands::Publish {
            table,
            change_type,
            record,
            old_record,
        } => {
            commands::publish::run(
                &client,
                output_format,
                cli.quiet,
                &table,
                &change_type,
                record.as_deref(),
                old_record.as_deref(),
            )
            .await
        }
        Commands::Health => commands::health::run(&client, output_format).await,
    }
}
