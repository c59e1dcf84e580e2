use super::{Notification, NotificationSink, Severity};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
	fn notify(&self, notification: Notification) {
		let link = notification
			.link
			.map(|link| format!(" ({})", link))
			.unwrap_or_default();
		match notification.severity {
			Severity::Error => error!("{}{}", notification.message, link),
			Severity::Alert => warn!("{}{}", notification.message, link),
			Severity::Info => info!("{}{}", notification.message, link),
		}
	}
}

/// Forwards notifications to a channel, e.g. a UI task. Dropped if nobody is listening.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
	sender: UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
	pub fn new(sender: UnboundedSender<Notification>) -> Self {
		Self { sender }
	}
}

impl NotificationSink for ChannelNotificationSink {
	fn notify(&self, notification: Notification) {
		if self.sender.send(notification).is_err() {
			tracing::debug!("Notification receiver closed, dropping notification");
		}
	}
}
