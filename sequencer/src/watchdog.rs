//! Deadline supervision for hardware commands
//!
//! A [`Watchdog`] races one command against its deadline and the caller's
//! cancellation token. Exactly one of three outcomes is returned to the
//! caller: the command's own result, [`SequencerError::Timeout`], or
//! [`SequencerError::Cancelled`]. A timed-out command future is dropped.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{SequencerError, SequencerResult};

#[derive(Debug, Clone)]
pub struct Watchdog {
    command: String,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `command` under this watchdog
    pub async fn guard<F, T, E>(&self, cancel: &CancellationToken, command: F) -> SequencerResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<SequencerError>,
    {
        if cancel.is_cancelled() {
            return Err(SequencerError::Cancelled(self.command.clone()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Watchdog: '{}' cancelled", self.command);
                Err(SequencerError::Cancelled(self.command.clone()))
            }
            result = tokio::time::timeout(self.timeout, command) => match result {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => {
                    tracing::error!(
                        "Watchdog: '{}' did not complete within {:.1}s",
                        self.command,
                        self.timeout.as_secs_f64()
                    );
                    Err(SequencerError::Timeout {
                        command: self.command.clone(),
                        timeout_secs: self.timeout.as_secs_f64(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[tokio::test]
    async fn test_completes_before_deadline() {
        let cancel = CancellationToken::new();
        let dog = Watchdog::new("filter change", Duration::from_secs(1));
        let value = dog
            .guard(&cancel, async { Ok::<_, DeviceError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_timeout_reaches_caller() {
        let cancel = CancellationToken::new();
        let dog = Watchdog::new("slew", Duration::from_millis(20));
        let result = dog
            .guard(&cancel, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DeviceError>(())
            })
            .await;
        match result {
            Err(SequencerError::Timeout { command, .. }) => assert_eq!(command, "slew"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_error_passes_through() {
        let cancel = CancellationToken::new();
        let dog = Watchdog::new("unpark", Duration::from_secs(1));
        let result: SequencerResult<()> = dog
            .guard(&cancel, async {
                Err(DeviceError::hardware("Telescope", "motor stall"))
            })
            .await;
        assert!(matches!(result, Err(SequencerError::Device(_))));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        let dog = Watchdog::new("exposure", Duration::from_secs(10));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = dog
            .guard(&cancel, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DeviceError>(())
            })
            .await;
        assert!(matches!(result, Err(SequencerError::Cancelled(_))));
    }
}
