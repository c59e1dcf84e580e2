//!
//! JSON-RPC client for the wallet node and the book-ledger service.
//!
//! This module provides an async client for issuing JSON-RPC 2.0 calls over HTTP and for opening
//! WebSocket subscriptions whose notifications are exposed as a stream. All methods are async and
//! designed for use with Tokio.

use super::types::*;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

/// Stream of subscription payloads (the `result` of each notification).
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<Value, RpcError>> + Send>>;

/// JSON-RPC client
#[derive(Clone)]
pub struct JsonRpcClient {
	/// The underlying HTTP client for calls.
	http_client: Client,
	/// The HTTP endpoint.
	rpc_url: String,
	/// The WebSocket endpoint for subscriptions, if any.
	ws_url: Option<String>,
	/// Request id counter shared by clones.
	next_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
	/// Create a new client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP endpoint for calls.
	/// * `ws_url` - The WebSocket endpoint for subscriptions, if the node offers one.
	///
	/// # Errors
	/// Returns `RpcError::Http` if the HTTP client cannot be built.
	pub fn new(rpc_url: String, ws_url: Option<String>) -> Result<Self, RpcError> {
		let http_client = Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.build()?;

		Ok(Self {
			http_client,
			rpc_url,
			ws_url,
			next_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn rpc_url(&self) -> &str {
		&self.rpc_url
	}

	pub fn ws_url(&self) -> Option<&str> {
		self.ws_url.as_deref()
	}

	fn next_request_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Execute a JSON-RPC call.
	///
	/// # Arguments
	/// * `method` - The method name.
	/// * `params` - Positional parameters as a JSON array.
	///
	/// # Returns
	/// The `result` member of the response (`Value::Null` if absent), or an `RpcError`.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
		let id = self.next_request_id();
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		debug!("JSON-RPC call {} (id {})", method, id);

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(RpcError::Status(response.status()));
		}

		let response: JsonRpcResponse = response.json().await?;
		response.into_result()
	}

	/// Open a subscription over WebSocket.
	///
	/// Sends `method(params)`, waits for the subscription id and returns a stream of the
	/// `result` payloads of every notification addressed to that subscription.
	///
	/// # Errors
	/// Returns `RpcError` if no WebSocket endpoint is configured, or if the connection or the
	/// subscription request fails.
	pub async fn subscribe(
		&self,
		method: &str,
		params: Value,
	) -> Result<NotificationStream, RpcError> {
		let ws_url = self.ws_url.as_deref().ok_or(RpcError::MissingWebSocketUrl)?;
		debug!("Attempting WebSocket connection to: {}", ws_url);

		let (ws_stream, response) = connect_async(ws_url).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let id = self.next_request_id();
		let subscribe_message = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for the subscription id
		let subscription_id = loop {
			match ws_receiver.next().await {
				Some(Ok(Message::Text(text))) => {
					let response: JsonRpcResponse = serde_json::from_str(&text)?;
					if !response.answers(id) {
						continue;
					}
					let result = response.into_result()?;
					break subscription_id_of(&result).ok_or_else(|| {
						RpcError::Subscription("Subscription id missing from response".to_string())
					})?;
				}
				Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
				Some(Ok(_)) => {
					return Err(RpcError::Subscription(
						"Unexpected message type during handshake".to_string(),
					));
				}
				Some(Err(e)) => return Err(e.into()),
				None => {
					return Err(RpcError::Subscription(
						"Connection closed during handshake".to_string(),
					));
				}
			}
		};

		info!("Subscribed via {} with id {}", method, subscription_id);

		// The sink half is kept alive for as long as the stream is
		let stream = ws_receiver.filter_map(move |msg| {
			let _sender = &ws_sender;
			let subscription_id = subscription_id.clone();
			async move {
				match msg {
					Ok(Message::Text(text)) => parse_notification(&text, &subscription_id),
					Ok(Message::Close(frame)) => {
						debug!("Subscription socket closed: {:?}", frame);
						None
					}
					Ok(_) => None,
					Err(e) => {
						error!("Error in subscription socket: {}", e);
						Some(Err(RpcError::WebSocket(e)))
					}
				}
			}
		});

		Ok(Box::pin(stream))
	}
}

fn subscription_id_of(result: &Value) -> Option<String> {
	match result {
		Value::String(id) => Some(id.clone()),
		Value::Number(id) => Some(id.to_string()),
		_ => None,
	}
}

/// Extract the payload of a notification addressed to `subscription_id`.
///
/// Returns `None` for messages that belong to other subscriptions or carry no payload.
fn parse_notification(text: &str, subscription_id: &str) -> Option<Result<Value, RpcError>> {
	let parsed = match serde_json::from_str::<Value>(text) {
		Ok(parsed) => parsed,
		Err(e) => return Some(Err(RpcError::Json(e))),
	};

	if let Some(error) = parsed.get("error") {
		let message = error
			.get("message")
			.and_then(Value::as_str)
			.unwrap_or("Unknown subscription error");
		return Some(Err(RpcError::Subscription(message.to_string())));
	}

	let params = parsed.get("params")?;
	let target = params.get("subscription").and_then(subscription_id_of)?;
	if target != subscription_id {
		debug!("Ignoring notification for subscription {}", target);
		return None;
	}

	match params.get("result") {
		Some(result) => Some(Ok(result.clone())),
		None => Some(Err(RpcError::NoData)),
	}
}
