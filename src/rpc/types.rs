//! Types for JSON-RPC requests, responses and remote failures

use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;

/// Error object carried by a failed JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(default)]
	pub data: Option<Value>,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
	#[serde(default)]
	pub id: Option<Value>,
	#[serde(default)]
	pub result: Option<Value>,
	#[serde(default)]
	pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
	/// Whether this response answers the request with the given id.
	pub fn answers(&self, request_id: u64) -> bool {
		self.id.as_ref().and_then(Value::as_u64) == Some(request_id)
	}

	/// Convert the envelope into its result. A missing or `null` result becomes `Value::Null`.
	pub fn into_result(self) -> Result<Value, RpcError> {
		if let Some(error) = self.error {
			return Err(RpcError::Rpc {
				code: error.code,
				message: error.message,
				data: error.data,
			});
		}
		Ok(self.result.unwrap_or(Value::Null))
	}
}

/// Error types for JSON-RPC transport and protocol failures
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("HTTP status: {0}")]
	Status(reqwest::StatusCode),

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("JSON parse error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("JSON-RPC error {code}: {message}")]
	Rpc {
		code: i64,
		message: String,
		data: Option<Value>,
	},

	#[error("No data returned")]
	NoData,

	#[error("Subscription error: {0}")]
	Subscription(String),

	#[error("No WebSocket endpoint configured")]
	MissingWebSocketUrl,
}

/// A failure reported by the remote side (wallet provider, node or ledger service).
///
/// Keeps the most specific details separately so that the user-facing description can prefer an
/// embedded provider-level message over the generic one, and fall back to the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
	/// Message of an error embedded by the provider, e.g. a revert reason.
	pub provider_message: Option<String>,
	/// Generic message of the failure.
	pub message: Option<String>,
	/// The raw failure payload.
	pub raw: Value,
}

impl RemoteFailure {
	pub fn message(message: impl Into<String>) -> Self {
		let message = message.into();
		Self {
			provider_message: None,
			raw: json!({ "message": message }),
			message: Some(message),
		}
	}

	/// Build a failure from a raw error payload, picking out `error.message`, `data.message` and
	/// `message` when present.
	pub fn from_raw(raw: Value) -> Self {
		let provider_message = raw
			.get("error")
			.and_then(|error| error.get("message"))
			.or_else(|| raw.get("data").and_then(|data| data.get("message")))
			.and_then(Value::as_str)
			.map(str::to_string);
		let message = raw.get("message").and_then(Value::as_str).map(str::to_string);

		Self {
			provider_message,
			message,
			raw,
		}
	}

	/// Human-readable description, most specific detail first.
	pub fn describe(&self) -> String {
		if let Some(message) = &self.provider_message {
			return format!("Error: {}", message);
		}
		if let Some(message) = &self.message {
			return format!("Error: {}", message);
		}
		format!("Operation failed. Reason: {}", self.raw)
	}
}

impl fmt::Display for RemoteFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.describe())
	}
}

impl From<RpcError> for RemoteFailure {
	fn from(error: RpcError) -> Self {
		match error {
			RpcError::Rpc {
				code,
				message,
				data,
			} => {
				let provider_message = data.as_ref().and_then(|data| {
					data.get("message")
						.and_then(Value::as_str)
						.or_else(|| data.as_str())
						.map(str::to_string)
				});
				Self {
					provider_message,
					raw: json!({ "code": code, "message": message, "data": data }),
					message: Some(message),
				}
			}
			other => Self::message(other.to_string()),
		}
	}
}

/// Parse a JSON quantity: a non-negative integer, a decimal string or a `0x` hex string.
pub fn parse_quantity(value: &Value) -> Option<u64> {
	match value {
		Value::Number(number) => number.as_u64(),
		Value::String(text) => {
			let text = text.trim();
			match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
				Some(hex_digits) if !hex_digits.is_empty() => u64::from_str_radix(hex_digits, 16).ok(),
				Some(_) => None,
				None => text.parse::<u64>().ok(),
			}
		}
		_ => None,
	}
}
