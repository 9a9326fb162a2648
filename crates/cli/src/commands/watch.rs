// Watch command - stream live changes until ctrl-c

use std::sync::Arc;
use std::time::Duration;

use crate::client::Client;
use crate::output::OutputFormat;
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use depot_core::{
    ChangeEvent, ChangeType, HttpTransport, Listener, ListenerState, ReconnectPolicy, Topic,
};

pub struct WatchOptions {
    pub topics: Vec<String>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: u64,
    pub show_heartbeats: bool,
}

impl WatchOptions {
    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::exponential()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_retries(self.max_retries)
    }

    fn parse_topics(&self) -> Result<Vec<Topic>> {
        anyhow::ensure!(!self.topics.is_empty(), "at least one --topic is required");
        self.topics
            .iter()
            .map(|t| {
                t.parse::<Topic>()
                    .with_context(|| format!("invalid topic '{}'", t))
            })
            .collect()
    }
}

/// One line of text output for an event
pub fn format_event(event: &ChangeEvent) -> String {
    let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    match &event.payload {
        Some(payload) => format!("{} {:<9} {}", timestamp, event.event_type.as_str(), payload),
        None => format!("{} {}", timestamp, event.event_type),
    }
}

fn print_event(output: OutputFormat, event: &ChangeEvent) {
    if output.is_text() {
        println!("{}", format_event(event));
    } else if let Err(e) = output.print_stream_item(event) {
        eprintln!("Failed to print event: {}", e);
    }
}

fn describe(state: &ListenerState) -> String {
    match state {
        ListenerState::Disconnected => "disconnected, retrying".to_string(),
        ListenerState::Connecting => "connecting...".to_string(),
        ListenerState::Connected => "connected".to_string(),
        ListenerState::Closed => "closed".to_string(),
        ListenerState::Failed(e) => format!("failed: {}", e),
    }
}

pub async fn run(client: &Client, output: OutputFormat, quiet: bool, options: WatchOptions) -> Result<()> {
    let topics = options.parse_topics()?;
    let show_heartbeats = options.show_heartbeats;

    let transport = Arc::new(HttpTransport::with_client(client.base_url(), client.http()));
    let handler = move |event: ChangeEvent| {
        if event.event_type == ChangeType::Heartbeat && !show_heartbeats {
            return;
        }
        print_event(output, &event);
    };
    let listener = Listener::spawn(transport, topics, handler, options.policy());

    if !quiet {
        eprintln!("Watching {} (ctrl-c to stop)", options.topics.join(", "));
    }

    let mut states = listener.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                listener.close();
                return Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = states.borrow_and_update().clone();
                if !quiet {
                    eprintln!("[{}]", describe(&state));
                }
                match state {
                    ListenerState::Failed(e) => return Err(e).context("Stopped watching"),
                    ListenerState::Closed => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}
