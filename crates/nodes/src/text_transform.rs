//! TEXT_TRANSFORM: caesar shift, reverse, SHA-256 hash, case conversion.
//!
//! Config:
//! ```json
//! { "operation": "caesar", "shift": 3, "field": "text" }
//! ```
//! The text comes from `config.text` if given, else from `input[field]`
//! (default field `text`), else from the input itself when it is a string.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutput};

/// Supported text operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOperation {
    Caesar,
    Reverse,
    Hash,
    Uppercase,
    Lowercase,
}

impl TextOperation {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "caesar" => Some(Self::Caesar),
            "reverse" => Some(Self::Reverse),
            "hash" | "sha256" => Some(Self::Hash),
            "uppercase" | "upper" => Some(Self::Uppercase),
            "lowercase" | "lower" => Some(Self::Lowercase),
            _ => None,
        }
    }
}

/// Shift ASCII letters by `shift` positions, wrapping within A–Z / a–z.
/// Everything else is left untouched.
pub fn caesar(text: &str, shift: i64) -> String {
    let shift = shift.rem_euclid(26) as u8;
    text.chars()
        .map(|c| match c {
            'a'..='z' => ((c as u8 - b'a' + shift) % 26 + b'a') as char,
            'A'..='Z' => ((c as u8 - b'A' + shift) % 26 + b'A') as char,
            _ => c,
        })
        .collect()
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub struct TextTransformNode;

impl TextTransformNode {
    fn source_text(config: &Value, input: &Value) -> Result<String, NodeError> {
        if let Some(text) = config.get("text").and_then(Value::as_str) {
            return Ok(text.to_owned());
        }
        let field = config.get("field").and_then(Value::as_str).unwrap_or("text");
        match input {
            Value::String(s) => Ok(s.clone()),
            Value::Object(map) => match map.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Ok(other.to_string()),
                None => Err(NodeError::Permanent(format!(
                    "invalid input: field '{field}' not found"
                ))),
            },
            other => Err(NodeError::Permanent(format!(
                "invalid input: expected text, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl ExecutableNode for TextTransformNode {
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let op_name = config
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::invalid_config("TEXT_TRANSFORM", "missing 'operation'"))?;
        let operation = TextOperation::parse(op_name).ok_or_else(|| {
            NodeError::invalid_config("TEXT_TRANSFORM", format!("unknown operation '{op_name}'"))
        })?;

        let text = Self::source_text(config, &input)?;
        let result = match operation {
            TextOperation::Caesar => {
                let shift = config.get("shift").and_then(Value::as_i64).unwrap_or(3);
                caesar(&text, shift)
            }
            TextOperation::Reverse => text.chars().rev().collect(),
            TextOperation::Hash => sha256_hex(&text),
            TextOperation::Uppercase => text.to_uppercase(),
            TextOperation::Lowercase => text.to_lowercase(),
        };

        Ok(NodeOutput::Complete(json!({
            "result": result,
            "operation": op_name,
        })))
    }
}
