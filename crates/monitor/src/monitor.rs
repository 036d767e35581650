//! The per-target polling loop.
//!
//! A [`TargetMonitor`] is the only writer of its target's last fingerprint.
//! The value lives in a `watch` channel so the reconciler can read it without
//! a lock and without ever racing the monitor for the write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sitewatch_config::MonitorConfig;

use crate::error::{ExtractionError, FetchError};
use crate::fetch::PageFetcher;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::notify::{Notification, Notifier};
use crate::targets::Target;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Pause between the end of one cycle and the start of the next.
    pub check_interval: Duration,
    /// Bound on a single fetch, independent of `check_interval`.
    pub fetch_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            fetch_timeout: config.fetch_timeout(),
        }
    }
}

/// What one fetch-compare-notify cycle concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Fetch or extraction failed; nothing was stored or sent.
    FetchFailed,
    /// First successful observation of the target.
    Baseline(Fingerprint),
    Unchanged,
    /// Content changed.  The new fingerprint is stored whether or not the
    /// notification went out.
    Changed {
        previous: Fingerprint,
        current: Fingerprint,
        notified: bool,
    },
}

pub struct TargetMonitor {
    target: Target,
    fetcher: Arc<dyn PageFetcher>,
    notifier: Arc<dyn Notifier>,
    settings: MonitorSettings,
    last: watch::Sender<Option<Fingerprint>>,
}

impl TargetMonitor {
    /// Create a monitor with no baseline.  The returned receiver observes the
    /// monitor's last fingerprint.
    pub fn new(
        target: Target,
        fetcher: Arc<dyn PageFetcher>,
        notifier: Arc<dyn Notifier>,
        settings: MonitorSettings,
    ) -> (Self, watch::Receiver<Option<Fingerprint>>) {
        let (last, rx) = watch::channel(None);
        let monitor = Self {
            target,
            fetcher,
            notifier,
            settings,
            last,
        };
        (monitor, rx)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last.borrow().clone()
    }

    /// Poll until `cancel` fires.  Cancellation interrupts both the sleep and
    /// an in-flight cycle; the fingerprint is replaced in one step, so an
    /// aborted cycle leaves either the old or the new value, never a mix.
    pub async fn run(self, cancel: CancellationToken) {
        let url = self.target.url.clone();
        info!(url = %url, "monitoring started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.run_cycle() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.check_interval) => {}
            }
        }

        info!(url = %url, "monitoring stopped");
    }

    /// One fetch → fingerprint → compare → notify pass.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let url = self.target.url.as_str();

        let current = match self.fetch_fingerprint().await {
            Ok(fp) => fp,
            Err(err) => {
                warn!(url = %url, %err, "could not fetch page; skipping this check");
                return CycleOutcome::FetchFailed;
            }
        };

        let previous = self.last.borrow().clone();
        match previous {
            None => {
                self.last.send_replace(Some(current.clone()));
                info!(url = %url, fingerprint = %current.short(), "baseline recorded");
                CycleOutcome::Baseline(current)
            }
            Some(previous) if previous == current => {
                debug!(url = %url, "no change");
                CycleOutcome::Unchanged
            }
            Some(previous) => {
                warn!(
                    url = %url,
                    from = %previous.short(),
                    to = %current.short(),
                    "content changed"
                );
                let notified = match self.notifier.notify(&Notification::site_changed(url)).await {
                    Ok(()) => {
                        info!(url = %url, "change notification sent");
                        true
                    }
                    Err(err) => {
                        error!(url = %url, %err, "change notification failed");
                        false
                    }
                };
                self.last.send_replace(Some(current.clone()));
                CycleOutcome::Changed {
                    previous,
                    current,
                    notified,
                }
            }
        }
    }

    async fn fetch_fingerprint(&self) -> Result<Fingerprint, FetchError> {
        let body = tokio::time::timeout(
            self.settings.fetch_timeout,
            self.fetcher.fetch(&self.target.url),
        )
        .await
        .map_err(|_| FetchError::Timeout)??;

        // Parsing a large page is CPU-bound; keep it off the async workers.
        let selector = self.target.selector.clone();
        let print = tokio::task::spawn_blocking(move || fingerprint(&body, selector.as_ref()))
            .await
            .map_err(|err| ExtractionError::Worker(err.to_string()))??;
        Ok(print)
    }
}
