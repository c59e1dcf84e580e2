//! User-facing notifications.
//!
//! Notifications are fire-and-forget: a sink may drop them, and nothing in the sync core depends
//! on whether they were shown.

/// Sink implementations
mod sinks;

pub use sinks::{ChannelNotificationSink, TracingNotificationSink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Error,
	Info,
	Alert,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Severity::Error => "error",
			Severity::Info => "info",
			Severity::Alert => "alert",
		};
		f.write_str(name)
	}
}

/// A transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
	pub severity: Severity,
	pub message: String,
	/// Block-explorer link for transaction notifications.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub link: Option<String>,
}

impl Notification {
	pub fn new(severity: Severity, message: impl Into<String>) -> Self {
		Self {
			severity,
			message: message.into(),
			link: None,
		}
	}

	pub fn info(message: impl Into<String>) -> Self {
		Self::new(Severity::Info, message)
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self::new(Severity::Error, message)
	}

	pub fn alert(message: impl Into<String>) -> Self {
		Self::new(Severity::Alert, message)
	}

	pub fn with_link(mut self, link: Option<String>) -> Self {
		self.link = link;
		self
	}
}

/// Destination for user-facing notifications.
pub trait NotificationSink: Send + Sync {
	fn notify(&self, notification: Notification);
}
