use super::types::SessionError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// File holding the remembered provider.
pub const CACHED_PROVIDER_FILE: &str = "cached_provider.json";
/// File holding a wallet-connect bridge session, if one was stored.
pub const WALLETCONNECT_FILE: &str = "walletconnect.json";

/// The remembered "last provider" preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProvider {
	pub provider_id: String,
	pub remembered_at: DateTime<Utc>,
}

/// Repository for the remembered provider
#[async_trait::async_trait]
pub trait ProviderCacheRepository: Send + Sync {
	async fn load(&self) -> Result<Option<CachedProvider>, SessionError>;
	async fn remember(&self, provider_id: &str) -> Result<(), SessionError>;
	/// Forget the provider and any stored bridge session.
	async fn clear(&self) -> Result<(), SessionError>;
}

/// File-based implementation of ProviderCacheRepository
pub struct FileProviderCache {
	data_dir: PathBuf,
}

impl FileProviderCache {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_provider_filename(&self) -> PathBuf {
		self.data_dir.join(CACHED_PROVIDER_FILE)
	}

	fn get_walletconnect_filename(&self) -> PathBuf {
		self.data_dir.join(WALLETCONNECT_FILE)
	}
}

async fn remove_if_present(path: &Path) -> Result<bool, SessionError> {
	match tokio::fs::remove_file(path).await {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
		Err(e) => Err(SessionError::Persistence(format!(
			"Failed to remove {:?}: {}",
			path, e
		))),
	}
}

#[async_trait::async_trait]
impl ProviderCacheRepository for FileProviderCache {
	async fn load(&self) -> Result<Option<CachedProvider>, SessionError> {
		let filename = self.get_provider_filename();

		let content = match tokio::fs::read_to_string(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
			Err(e) => {
				return Err(SessionError::Persistence(format!(
					"Failed to read cached provider: {}",
					e
				)));
			}
		};

		let cached: CachedProvider = serde_json::from_str(&content).map_err(|e| {
			SessionError::Persistence(format!("Failed to parse cached provider: {}", e))
		})?;

		debug!("Loaded cached provider {} from {:?}", cached.provider_id, filename);
		Ok(Some(cached))
	}

	async fn remember(&self, provider_id: &str) -> Result<(), SessionError> {
		tokio::fs::create_dir_all(&self.data_dir).await.map_err(|e| {
			SessionError::Persistence(format!("Failed to create data directory: {}", e))
		})?;

		let cached = CachedProvider {
			provider_id: provider_id.to_string(),
			remembered_at: Utc::now(),
		};
		let content = serde_json::to_string_pretty(&cached).map_err(|e| {
			SessionError::Persistence(format!("Failed to serialize cached provider: {}", e))
		})?;

		let filename = self.get_provider_filename();
		tokio::fs::write(&filename, content).await.map_err(|e| {
			SessionError::Persistence(format!("Failed to write cached provider: {}", e))
		})?;

		info!("Remembered provider {} in {:?}", provider_id, filename);
		Ok(())
	}

	async fn clear(&self) -> Result<(), SessionError> {
		let provider = remove_if_present(&self.get_provider_filename()).await?;
		let bridge = remove_if_present(&self.get_walletconnect_filename()).await?;
		if provider || bridge {
			info!("Cleared cached provider state in {:?}", self.data_dir);
		}
		Ok(())
	}
}

/// In-memory implementation of ProviderCacheRepository, for embedders without a data directory.
#[derive(Default)]
pub struct MemoryProviderCache {
	cached: Mutex<Option<CachedProvider>>,
}

impl MemoryProviderCache {
	pub fn new() -> Self {
		Self::default()
	}

	fn cached(&self) -> MutexGuard<'_, Option<CachedProvider>> {
		self.cached.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[async_trait::async_trait]
impl ProviderCacheRepository for MemoryProviderCache {
	async fn load(&self) -> Result<Option<CachedProvider>, SessionError> {
		Ok(self.cached().clone())
	}

	async fn remember(&self, provider_id: &str) -> Result<(), SessionError> {
		*self.cached() = Some(CachedProvider {
			provider_id: provider_id.to_string(),
			remembered_at: Utc::now(),
		});
		Ok(())
	}

	async fn clear(&self) -> Result<(), SessionError> {
		self.cached().take();
		Ok(())
	}
}
