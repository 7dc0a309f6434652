//! Periodic token probe and the process-wide stop signal

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{is_unauthenticated, Error};
use crate::linode::LinodeApi;

/// Closed once when the controllers must wind down
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Returns true only for the call that actually stopped the process
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // a closed sender cannot happen while `self` holds it
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

pub struct HealthChecker {
    linode: Arc<dyn LinodeApi>,
    period: Duration,
    stop: StopSignal,
}

impl HealthChecker {
    pub fn new(linode: Arc<dyn LinodeApi>, period: Duration, stop: StopSignal) -> Self {
        Self {
            linode,
            period,
            stop,
        }
    }

    /// One probe. Returns false when the token has been rejected.
    pub async fn check(&self) -> bool {
        match self.linode.get_profile().await {
            Ok(profile) => {
                debug!(username = %profile.username, "Linode token is valid");
                true
            }
            Err(e) => {
                let err = Error::from(e);
                if is_unauthenticated(&err) {
                    error!(error = %err, "Linode token was rejected, stopping controllers");
                    self.stop.trigger();
                    false
                } else {
                    warn!(error = %err, "token health check failed");
                    true
                }
            }
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = self.stop.wait() => return,
                _ = ticker.tick() => {
                    if !self.check().await {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linode::fake::FakeLinode;

    #[tokio::test]
    async fn test_trigger_is_once() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert!(stop.trigger());
        assert!(!stop.trigger());
        assert!(stop.is_stopped());
        stop.wait().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_ignored() {
        let fake = Arc::new(FakeLinode::new());
        let stop = StopSignal::new();
        let checker = HealthChecker::new(fake.clone(), Duration::from_secs(1), stop.clone());

        fake.fail_next("GetProfile", 500);
        assert!(checker.check().await);
        assert!(!stop.is_stopped());
        assert!(checker.check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_stops_everything() {
        let fake = Arc::new(FakeLinode::new());
        let stop = StopSignal::new();
        let checker = HealthChecker::new(fake.clone(), Duration::from_secs(30), stop.clone());

        fake.fail_next("GetProfile", 401);
        checker.run().await;
        assert!(stop.is_stopped());
    }
}
