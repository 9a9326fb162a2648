// Stream framing
//
// One event per frame: a single `data:` line holding a JSON object,
// followed by a blank line.
//
//   data: {"type":"connected","timestamp":"2024-01-01T00:00:00.000Z"}\n\n

use tracing::warn;

use crate::error::RelayError;
use crate::events::ChangeEvent;

const DATA_PREFIX: &str = "data:";

/// One serialized event, ready to be written in a single flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    json: String,
}

impl Frame {
    /// Serialize an event; events violating the payload rules are rejected
    pub fn encode(event: &ChangeEvent) -> Result<Self, RelayError> {
        event.validate()?;
        let json = serde_json::to_string(event)?;
        Ok(Self { json })
    }

    /// JSON body of the frame
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Exact wire text including the frame delimiter
    pub fn to_wire(&self) -> String {
        format!("{} {}\n\n", DATA_PREFIX, self.json)
    }
}

/// Incremental decoder for wire text.
///
/// Input may be split at arbitrary byte boundaries. A frame whose body fails
/// to parse is dropped and decoding resumes at the next blank line.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<ChangeEvent> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            match Self::decode_block(&block) {
                Some(Ok(event)) => events.push(event),
                Some(Err(e)) => {
                    self.skipped += 1;
                    warn!(error = %e, "Skipping undecodable frame");
                }
                None => {}
            }
        }
        events
    }

    /// Frames dropped because they failed to parse
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_block(block: &str) -> Option<Result<ChangeEvent, RelayError>> {
        let data: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix(DATA_PREFIX))
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            .collect();

        // Comment-only or empty blocks carry no event
        if data.is_empty() {
            return None;
        }
        Some(ChangeEvent::parse(&data.join("\n")))
    }
}
