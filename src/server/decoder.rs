// Generic JSON value: objects, arrays and scalars alike
use serde_json::Value as JsonValue;

// Derive the wire shape of acknowledgement frames
use serde::Serialize;

/// Reason string sent back for a line that is not JSON.
pub const INVALID_JSON: &str = "invalid_json";

/// Outcome of parsing one record.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Well-formed JSON of any shape
    Valid(JsonValue),
    /// Anything else, kept verbatim for the text log
    Invalid(String),
}

impl DecodedMessage {
    pub fn is_valid(&self) -> bool {
        matches!(self, DecodedMessage::Valid(_))
    }

    /// Payload column of the text log: compact JSON, or the raw text for
    /// lines that did not parse.
    pub fn log_payload(&self) -> String {
        match self {
            DecodedMessage::Valid(value) => value.to_string(),
            DecodedMessage::Invalid(text) => format!("Non-JSON: {}", text),
        }
    }
}

/// Strict JSON decode; a parse failure is a normal outcome, not an error.
pub fn decode(record: &str) -> DecodedMessage {
    match serde_json::from_str::<JsonValue>(record) {
        Ok(value) => DecodedMessage::Valid(value),
        Err(_) => DecodedMessage::Invalid(record.to_string()),
    }
}

/// Reply frame written back after every record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Ack {
    /// `{"status":"ok","received":"<ISO-8601>"}`
    Ok { received: String },
    /// `{"status":"error","reason":"invalid_json"}`
    Error { reason: &'static str },
}

impl Ack {
    /// Acknowledgement matching a decoded record.
    pub fn for_message(message: &DecodedMessage, received: &str) -> Self {
        if message.is_valid() {
            Ack::Ok {
                received: received.to_string(),
            }
        } else {
            Ack::Error {
                reason: INVALID_JSON,
            }
        }
    }

    /// Wire bytes: one compact JSON object plus `\n`.
    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}
