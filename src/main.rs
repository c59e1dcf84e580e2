use book_library_sync::ledger::Book;
use book_library_sync::notification::TracingNotificationSink;
use book_library_sync::sync::EnginePhase;
use book_library_sync::{ClientConfig, LibraryClient};

use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting book library sync");

	let config = match ClientConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return;
		}
	};

	let client = match LibraryClient::from_config(&config, Arc::new(TracingNotificationSink)) {
		Ok(client) => client,
		Err(e) => {
			error!("Failed to create client: {}", e);
			return;
		}
	};

	let connected = match client.restore().await {
		Ok(true) => Ok(()),
		Ok(false) => client.connect().await,
		Err(e) => Err(e),
	};
	if let Err(e) = connected {
		error!("Failed to connect: {}", e);
		client.disconnect().await;
		return;
	}

	let session = client.session().session();
	info!(
		"Connected as {} on chain {}",
		session.address, session.chain_id
	);
	log_books(&client.engine().books());

	let mut phase = client.engine().subscribe_phase();
	let mut books = client.engine().subscribe_books();
	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);
	loop {
		tokio::select! {
			changed = books.changed() => {
				if changed.is_err() {
					break;
				}
				let current = books.borrow_and_update().clone();
				log_books(&current);
			}
			changed = phase.changed() => {
				if changed.is_err() {
					break;
				}
				let current = *phase.borrow_and_update();
				match current {
					EnginePhase::Faulted => warn!("Book list could not be loaded"),
					EnginePhase::Idle => {
						info!("Session ended");
						break;
					}
					EnginePhase::Loading | EnginePhase::Ready => {}
				}
			}
			_ = &mut shutdown => {
				info!("Shutting down");
				break;
			}
		}
	}

	client.disconnect().await;
}

fn log_books(books: &[Book]) {
	info!("{} books in the library", books.len());
	for book in books {
		info!(
			"  #{} {} ({} copies)",
			book.id, book.title, book.number_of_copies
		);
	}
}
