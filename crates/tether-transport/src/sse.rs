//! Incremental server-sent events parser for the HTTP push channel.
//!
//! Parses raw response bytes into SSE records per the W3C EventSource
//! framing; each record's `data` payload is expected to be one JSON-RPC
//! frame, but that is the caller's concern.

/// One parsed SSE record.
#[derive(Debug, Clone)]
pub(crate) struct SseRecord {
    pub event_type: Option<String>,
    pub data: String,
}

/// Stateful parser fed with arbitrary chunk boundaries.
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed a chunk and return the records it completed.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<SseRecord> {
        // Normalize CRLF so record boundaries are always "\n\n".
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut records = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);

            if let Some(record) = Self::parse_block(&block) {
                records.push(record);
            }
        }

        records
    }

    fn parse_block(block: &str) -> Option<SseRecord> {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue; // comment
            }
            if let Some((field, value)) = line.split_once(':') {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => event_type = Some(value.to_string()),
                    "data" => data_lines.push(value.to_string()),
                    _ => {}
                }
            } else if line == "data" {
                data_lines.push(String::new());
            }
        }

        if data_lines.is_empty() {
            return None;
        }

        Some(SseRecord {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}
