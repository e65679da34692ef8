use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::adapter::AuthContext;
use crate::error::{SyncError, SyncResultOf};

/// Source of fresh credentials. Implementations talk to whatever identity
/// provider the host application uses.
#[async_trait]
pub trait TokenManager: Send + Sync {
	/// Exchange `current` for a context with a later expiry.
	async fn refresh(&self, current: &AuthContext) -> SyncResultOf<AuthContext>;
}

/// Auth context shared by every adapter call.
pub struct AuthState {
	context: RwLock<Option<AuthContext>>,
	manager: RwLock<Option<Arc<dyn TokenManager>>>,
	refresh_margin: Duration,
	// one refresh at a time
	refreshing: Mutex<()>,
}

impl AuthState {
	pub fn new(refresh_margin: Duration) -> Self {
		Self {
			context: RwLock::new(None),
			manager: RwLock::new(None),
			refresh_margin,
			refreshing: Mutex::new(()),
		}
	}

	pub async fn set(&self, ctx: AuthContext) {
		info!("auth context set for user '{}'", ctx.user_id);
		*self.context.write().await = Some(ctx);
	}

	pub async fn clear(&self) {
		if self.context.write().await.take().is_some() {
			warn!("auth context cleared");
		}
	}

	pub async fn set_token_manager(&self, manager: Arc<dyn TokenManager>) {
		*self.manager.write().await = Some(manager);
	}

	pub async fn current(&self) -> Option<AuthContext> {
		self.context.read().await.clone()
	}

	pub async fn is_present(&self) -> bool {
		self.context.read().await.is_some()
	}

	/// Context that is valid for at least the refresh margin, refreshing it
	/// through the token manager when it is close to expiry.
	pub async fn ensure_fresh(&self) -> SyncResultOf<AuthContext> {
		let margin = chrono::Duration::from_std(self.refresh_margin).unwrap_or_else(|_| chrono::Duration::zero());
		let now = Utc::now();

		let current = self
			.current()
			.await
			.ok_or_else(|| SyncError::Authentication("no auth context".to_string()))?;
		if !current.expires_within(margin, now) {
			return Ok(current);
		}

		let _guard = self.refreshing.lock().await;
		// Another task may have refreshed while we waited.
		let current = self
			.current()
			.await
			.ok_or_else(|| SyncError::Authentication("no auth context".to_string()))?;
		if !current.expires_within(margin, Utc::now()) {
			return Ok(current);
		}

		let manager = self.manager.read().await.clone();
		let expired = current.expires_within(chrono::Duration::zero(), Utc::now());
		match manager {
			Some(m) => match m.refresh(&current).await {
				Ok(fresh) => {
					debug!("auth token refreshed for '{}'", fresh.user_id);
					*self.context.write().await = Some(fresh.clone());
					Ok(fresh)
				}
				Err(e) if !expired => {
					warn!("token refresh failed, using current token until expiry: {}", e);
					Ok(current)
				}
				Err(e) => Err(SyncError::Authentication(format!("token refresh failed: {}", e))),
			},
			None if expired => Err(SyncError::Authentication("auth token expired".to_string())),
			None => Ok(current),
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingManager {
		calls: AtomicUsize,
		fail: bool,
	}

	#[async_trait]
	impl TokenManager for CountingManager {
		async fn refresh(&self, current: &AuthContext) -> SyncResultOf<AuthContext> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				return Err(SyncError::Network("idp down".into()));
			}
			Ok(AuthContext::new(current.user_id.clone(), "fresh-token")
				.with_expiry(Utc::now() + chrono::Duration::hours(1)))
		}
	}

	#[tokio::test]
	async fn test_missing_context_is_auth_error() {
		let state = AuthState::new(Duration::from_secs(60));
		assert!(matches!(state.ensure_fresh().await, Err(SyncError::Authentication(_))));
		assert!(!state.is_present().await);
	}

	#[tokio::test]
	async fn test_refresh_near_expiry() {
		let state = AuthState::new(Duration::from_secs(300));
		let manager = Arc::new(CountingManager {
			calls: AtomicUsize::new(0),
			fail: false,
		});
		state.set_token_manager(manager.clone()).await;
		state
			.set(AuthContext::new("u1", "old").with_expiry(Utc::now() + chrono::Duration::seconds(30)))
			.await;

		let ctx = state.ensure_fresh().await.expect("fresh");
		assert_eq!(ctx.token, "fresh-token");
		// Second call sees the new expiry and does not refresh again.
		state.ensure_fresh().await.expect("fresh");
		assert_eq!(manager.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_failed_refresh_keeps_unexpired_token() {
		let state = AuthState::new(Duration::from_secs(300));
		state
			.set_token_manager(Arc::new(CountingManager {
				calls: AtomicUsize::new(0),
				fail: true,
			}))
			.await;
		state
			.set(AuthContext::new("u1", "old").with_expiry(Utc::now() + chrono::Duration::seconds(30)))
			.await;
		assert_eq!(state.ensure_fresh().await.expect("current").token, "old");

		state
			.set(AuthContext::new("u1", "old").with_expiry(Utc::now() - chrono::Duration::seconds(1)))
			.await;
		assert!(matches!(state.ensure_fresh().await, Err(SyncError::Authentication(_))));
	}

	#[tokio::test]
	async fn test_clear() {
		let state = AuthState::new(Duration::from_secs(60));
		state.set(AuthContext::new("u1", "t")).await;
		assert!(state.is_present().await);
		state.clear().await;
		assert!(!state.is_present().await);
	}
}
