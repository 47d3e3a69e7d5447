use std::sync::Arc;
use std::time::Duration;

use genie_core::oauth::OAuthSessionManager;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Background task that drops expired authorization codes and requests.
/// Owned by whoever hosts the OAuth endpoints; stopped with them.
pub struct CodeSweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CodeSweeper {
    pub fn start(manager: Arc<OAuthSessionManager>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.cleanup_expired();
                        if !report.is_empty() {
                            info!(
                                codes = report.codes,
                                requests = report.requests,
                                "cleaned up expired authorization state"
                            );
                        }
                    }
                }
            }
            debug!("code sweeper stopped");
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CodeSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
