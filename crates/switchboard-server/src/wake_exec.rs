//! Wake executor implementations.
//!
//! The exchange fires one async `wake` per queued dial; the handler
//! variant stored in the profile decides how the sleeping agent gets
//! poked: a webhook POST or a spawned command. Both run under the
//! profile's per-attempt deadline, and any failure surfaces to the
//! caller as `BUSY{wake_failed}`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use switchboard_core::{WakeError, WakeExecutor, WakeHandler, WakeProfile};

/// Executor dispatching on the profile's handler variant.
pub struct HandlerWakeExecutor {
    client: reqwest::Client,
}

impl HandlerWakeExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn wake_webhook(&self, profile: &WakeProfile, url: &str) -> Result<(), WakeError> {
        let response = self
            .client
            .post(url)
            .timeout(profile.handler.timeout())
            .json(profile)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WakeError::Timeout
                } else {
                    WakeError::Request(e.to_string())
                }
            })?;

        if response.status().is_success() {
            debug!(address = %profile.address, url, "wake webhook delivered");
            Ok(())
        } else {
            Err(WakeError::Request(format!(
                "webhook returned {}",
                response.status()
            )))
        }
    }

    async fn wake_spawn(&self, profile: &WakeProfile, command: &[String]) -> Result<(), WakeError> {
        let Some((program, args)) = command.split_first() else {
            return Err(WakeError::Request("empty wake command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let status = tokio::time::timeout(profile.handler.timeout(), async {
            cmd.status()
                .await
                .map_err(|e| WakeError::Request(e.to_string()))
        })
        .await
        .map_err(|_| WakeError::Timeout)??;

        if status.success() {
            debug!(address = %profile.address, program, "wake command succeeded");
            Ok(())
        } else {
            Err(WakeError::NonZeroExit(status.code().unwrap_or(-1)))
        }
    }
}

impl Default for HandlerWakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WakeExecutor for HandlerWakeExecutor {
    async fn wake(&self, profile: &WakeProfile) -> Result<(), WakeError> {
        let result = match &profile.handler {
            WakeHandler::Webhook { url, .. } => self.wake_webhook(profile, url).await,
            WakeHandler::Spawn { command, .. } => self.wake_spawn(profile, command).await,
        };
        if let Err(ref e) = result {
            warn!(address = %profile.address, error = %e, "wake attempt failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_profile(command: Vec<&str>, timeout: Duration) -> WakeProfile {
        WakeProfile {
            address: "bot@x.y".into(),
            handler: WakeHandler::Spawn {
                command: command.into_iter().map(String::from).collect(),
                timeout,
            },
        }
    }

    #[tokio::test]
    async fn test_spawn_success() {
        let exec = HandlerWakeExecutor::new();
        let profile = spawn_profile(vec!["true"], Duration::from_secs(5));
        assert!(exec.wake(&profile).await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_nonzero_exit() {
        let exec = HandlerWakeExecutor::new();
        let profile = spawn_profile(vec!["false"], Duration::from_secs(5));
        assert!(matches!(
            exec.wake(&profile).await,
            Err(WakeError::NonZeroExit(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_timeout() {
        let exec = HandlerWakeExecutor::new();
        let profile = spawn_profile(vec!["sleep", "5"], Duration::from_millis(120));
        assert!(matches!(exec.wake(&profile).await, Err(WakeError::Timeout)));
    }

    #[tokio::test]
    async fn test_webhook_connection_refused() {
        let exec = HandlerWakeExecutor::new();
        let profile = WakeProfile {
            address: "bot@x.y".into(),
            handler: WakeHandler::Webhook {
                url: "http://127.0.0.1:1/wake".into(),
                timeout: Duration::from_millis(500),
            },
        };
        assert!(exec.wake(&profile).await.is_err());
    }
}
