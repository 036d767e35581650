//! Keeps the set of running monitors in step with the target file.
//!
//! The reconciler is the only code that inserts into or removes from the
//! URL → monitor map.  Each entry's fingerprint is written by its own monitor
//! task and only read here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SourceError;
use crate::fetch::PageFetcher;
use crate::fingerprint::Fingerprint;
use crate::monitor::{MonitorSettings, TargetMonitor};
use crate::notify::Notifier;
use crate::targets::{SourceMarker, Target, TargetSource};

/// Everything a newly spawned monitor needs.  Cheap to clone.
#[derive(Clone)]
pub struct MonitorContext {
    pub fetcher: Arc<dyn PageFetcher>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: MonitorSettings,
}

struct MonitorHandle {
    target: Target,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    last_fingerprint: watch::Receiver<Option<Fingerprint>>,
}

/// URLs touched by one reconciliation, each list sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Same URL, different selector: the old monitor was stopped and a fresh
    /// one started.
    pub replaced: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

pub struct Reconciler {
    source: TargetSource,
    ctx: MonitorContext,
    watch_interval: Duration,
    running: HashMap<String, MonitorHandle>,
    marker: Option<SourceMarker>,
    /// Parent of every monitor's token; cancelling it stops them all.
    root: CancellationToken,
}

impl Reconciler {
    pub fn new(source: TargetSource, ctx: MonitorContext, watch_interval: Duration) -> Self {
        Self {
            source,
            ctx,
            watch_interval,
            running: HashMap::new(),
            marker: None,
            root: CancellationToken::new(),
        }
    }

    /// Initial load.  An unreadable target file yields an empty set; the
    /// watch loop picks the file up once it becomes readable and changes.
    pub async fn start(&mut self) -> ReconcileSummary {
        let desired = match self.read_source() {
            Ok(targets) => targets,
            Err(err) => {
                error!(%err, "failed to read target file; starting with no targets");
                Vec::new()
            }
        };
        if desired.is_empty() {
            warn!(path = %self.source.path().display(), "no targets to monitor yet");
        }
        self.reconcile(desired).await
    }

    /// Make the running set equal to `desired`.
    ///
    /// Monitors whose target is unchanged are left alone and keep their
    /// fingerprint.  Removed monitors are cancelled and awaited before their
    /// state is dropped.
    pub async fn reconcile(&mut self, desired: Vec<Target>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let wanted: HashSet<&str> = desired.iter().map(|t| t.url.as_str()).collect();

        let mut gone: Vec<String> = self
            .running
            .keys()
            .filter(|url| !wanted.contains(url.as_str()))
            .cloned()
            .collect();
        gone.sort();
        for url in gone {
            self.stop(&url).await;
            info!(url = %url, "target removed; monitoring stopped");
            summary.removed.push(url);
        }

        for target in desired {
            let unchanged = self.running.get(&target.url).map(|h| h.target == target);
            match unchanged {
                Some(true) => continue,
                Some(false) => {
                    self.stop(&target.url).await;
                    info!(
                        url = %target.url,
                        selector = ?target.selector,
                        "target selector changed; restarting with a fresh baseline"
                    );
                    summary.replaced.push(target.url.clone());
                }
                None => {
                    info!(url = %target.url, selector = ?target.selector, "target added");
                    summary.added.push(target.url.clone());
                }
            }
            self.spawn(target);
        }

        summary.added.sort();
        summary.replaced.sort();
        summary
    }

    /// Check the target file's modification marker and reconcile if it moved.
    ///
    /// Returns `None` when the file is unchanged or could not be read; in the
    /// latter case the current targets stay as they are.
    pub async fn poll_source(&mut self) -> Option<ReconcileSummary> {
        let current = self.source.marker();
        if current == self.marker {
            return None;
        }
        info!(path = %self.source.path().display(), "target file changed");

        match self.read_source() {
            Ok(desired) => Some(self.reconcile(desired).await),
            Err(err) => {
                error!(%err, "failed to read target file; keeping current targets");
                None
            }
        }
    }

    /// Load the target file and remember its marker.  An I/O failure leaves
    /// the marker alone so the next tick tries again; a parse failure is
    /// remembered until the file is edited.
    fn read_source(&mut self) -> Result<Vec<Target>, SourceError> {
        let marker = self.source.marker();
        let loaded = self.source.load();
        if !matches!(loaded, Err(SourceError::Io { .. })) {
            self.marker = marker;
        }
        loaded
    }

    /// Watch the target file every `watch_interval` until `shutdown` fires,
    /// then stop every monitor.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; `start` already read the file.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Some(summary) = self.poll_source().await {
                info!(
                    added = summary.added.len(),
                    removed = summary.removed.len(),
                    replaced = summary.replaced.len(),
                    running = self.running.len(),
                    "targets reconciled"
                );
            }
        }

        self.shutdown().await;
    }

    /// Cancel and await every monitor.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        for (url, handle) in self.running.drain() {
            if let Err(err) = handle.task.await {
                error!(url = %url, ?err, "monitor task ended abnormally");
            }
        }
        self.root = CancellationToken::new();
        info!("all monitors stopped");
    }

    /// URLs currently monitored, sorted.
    pub fn running_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.running.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn is_running(&self, url: &str) -> bool {
        self.running.contains_key(url)
    }

    /// Last fingerprint observed by the monitor for `url`, if any.
    pub fn last_fingerprint(&self, url: &str) -> Option<Fingerprint> {
        self.running
            .get(url)
            .and_then(|h| h.last_fingerprint.borrow().clone())
    }

    fn spawn(&mut self, target: Target) {
        let (monitor, last_fingerprint) = TargetMonitor::new(
            target.clone(),
            self.ctx.fetcher.clone(),
            self.ctx.notifier.clone(),
            self.ctx.settings.clone(),
        );
        let cancel = self.root.child_token();
        let task = tokio::spawn(monitor.run(cancel.clone()));
        self.running.insert(
            target.url.clone(),
            MonitorHandle {
                target,
                cancel,
                task,
                last_fingerprint,
            },
        );
    }

    async fn stop(&mut self, url: &str) {
        let Some(handle) = self.running.remove(url) else {
            return;
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            error!(url = %url, ?err, "monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    use crate::testing::{FakeWeb, Outbox, settings};

    const A: &str = "http://example.test/a";
    const B: &str = "http://example.test/b";
    const C: &str = "http://example.test/c";
    const WATCH: Duration = Duration::from_secs(300);

    struct Harness {
        _dir: TempDir,
        path: std::path::PathBuf,
        web: Arc<FakeWeb>,
        outbox: Arc<Outbox>,
        reconciler: Reconciler,
    }

    fn harness(initial: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.json");
        fs::write(&path, initial).unwrap();

        let web = FakeWeb::new();
        for url in [A, B, C] {
            web.set(url, &format!("<p>{url} v1</p>"));
        }
        let outbox = Outbox::new();
        let ctx = MonitorContext {
            fetcher: web.clone(),
            notifier: outbox.clone(),
            settings: settings(),
        };
        let reconciler = Reconciler::new(TargetSource::new(&path), ctx, WATCH);
        Harness {
            _dir: dir,
            path,
            web,
            outbox,
            reconciler,
        }
    }

    fn targets_json(urls: &[&str]) -> String {
        let items: Vec<String> = urls.iter().map(|u| format!(r#"{{"url": "{u}"}}"#)).collect();
        format!("[{}]", items.join(", "))
    }

    fn write(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
    }

    /// Let freshly spawned monitors finish their first cycle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_one_monitor_per_target() {
        let mut h = harness(&targets_json(&[A, B]));
        let summary = h.reconciler.start().await;
        assert_eq!(summary.added, vec![A.to_string(), B.to_string()]);
        assert_eq!(h.reconciler.running_urls(), vec![A.to_string(), B.to_string()]);

        settle().await;
        assert!(h.reconciler.last_fingerprint(A).is_some());
        assert!(h.reconciler.last_fingerprint(B).is_some());
        assert!(h.outbox.sent().is_empty());
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_file_starts_empty() {
        let mut h = harness("[{ not json");
        assert!(h.reconciler.start().await.is_empty());
        assert!(h.reconciler.running_urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_is_picked_up_once_it_appears() {
        let mut h = harness("");
        fs::remove_file(&h.path).unwrap();
        assert!(h.reconciler.start().await.is_empty());
        assert!(h.reconciler.poll_source().await.is_none());

        write(&h.path, &targets_json(&[A]));
        let summary = h.reconciler.poll_source().await.unwrap();
        assert_eq!(summary.added, vec![A.to_string()]);
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_file_is_not_reread() {
        let mut h = harness(&targets_json(&[A]));
        h.reconciler.start().await;
        assert!(h.reconciler.poll_source().await.is_none());
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removal_keeps_neighbours_untouched() {
        let mut h = harness(&targets_json(&[A, B, C]));
        h.reconciler.start().await;
        settle().await;
        let fa = h.reconciler.last_fingerprint(A).unwrap();
        let fc = h.reconciler.last_fingerprint(C).unwrap();

        write(&h.path, &targets_json(&[A, C]));
        let summary = h.reconciler.poll_source().await.unwrap();
        assert_eq!(summary.removed, vec![B.to_string()]);
        assert!(summary.added.is_empty());
        assert!(!h.reconciler.is_running(B));
        assert_eq!(h.reconciler.last_fingerprint(B), None);

        settle().await;
        assert_eq!(h.reconciler.last_fingerprint(A), Some(fa));
        assert_eq!(h.reconciler.last_fingerprint(C), Some(fc));
        // No re-baseline fetch: A and C were fetched exactly once so far.
        assert_eq!(h.web.hits(A), 1);
        assert_eq!(h.web.hits(C), 1);
        assert!(h.outbox.sent().is_empty());
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn readded_target_starts_fresh() {
        let mut h = harness(&targets_json(&[A]));
        h.reconciler.start().await;
        settle().await;
        let old = h.reconciler.last_fingerprint(A).unwrap();

        h.reconciler.reconcile(Vec::new()).await;
        assert!(!h.reconciler.is_running(A));

        // The page changes while it is not watched.
        h.web.set(A, "<p>rewritten</p>");
        let summary = h.reconciler.reconcile(vec![Target::new(A)]).await;
        assert_eq!(summary.added, vec![A.to_string()]);
        assert_eq!(h.reconciler.last_fingerprint(A), None);

        settle().await;
        let fresh = h.reconciler.last_fingerprint(A).unwrap();
        assert_ne!(fresh, old);
        assert!(h.outbox.sent().is_empty(), "a re-added target must re-baseline silently");
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn selector_change_replaces_monitor() {
        let mut h = harness(&targets_json(&[A]));
        h.reconciler.start().await;
        settle().await;

        let summary = h
            .reconciler
            .reconcile(vec![Target::with_selector(A, "p")])
            .await;
        assert_eq!(summary.replaced, vec![A.to_string()]);
        assert!(summary.added.is_empty() && summary.removed.is_empty());
        assert_eq!(h.reconciler.last_fingerprint(A), None);

        settle().await;
        assert!(h.reconciler.last_fingerprint(A).is_some());
        assert!(h.outbox.sent().is_empty());
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn identical_desired_set_is_a_no_op() {
        let mut h = harness(&targets_json(&[A, B]));
        h.reconciler.start().await;
        let summary = h
            .reconciler
            .reconcile(vec![Target::new(B), Target::new(A)])
            .await;
        assert!(summary.is_empty());
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_edit_keeps_previous_targets() {
        let mut h = harness(&targets_json(&[A, B]));
        h.reconciler.start().await;

        write(&h.path, "[{\"url\": ");
        assert!(h.reconciler.poll_source().await.is_none());
        assert_eq!(h.reconciler.running_urls(), vec![A.to_string(), B.to_string()]);

        // Same broken content again: marker unchanged, no second attempt.
        assert!(h.reconciler.poll_source().await.is_none());

        // Fixing the file applies the new set.
        write(&h.path, &targets_json(&[B]));
        let summary = h.reconciler.poll_source().await.unwrap();
        assert_eq!(summary.removed, vec![A.to_string()]);
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_file_is_retried_on_next_tick() {
        let mut h = harness(&targets_json(&[A]));
        h.reconciler.start().await;
        let recorded = h.reconciler.marker;

        // A directory in place of the file: metadata succeeds, reading fails.
        fs::remove_file(&h.path).unwrap();
        fs::create_dir(&h.path).unwrap();
        assert!(h.reconciler.poll_source().await.is_none());
        assert_eq!(h.reconciler.marker, recorded);
        assert!(h.reconciler.poll_source().await.is_none());
        assert_eq!(h.reconciler.running_urls(), vec![A.to_string()]);

        fs::remove_dir(&h.path).unwrap();
        write(&h.path, &targets_json(&[A, B]));
        let summary = h.reconciler.poll_source().await.unwrap();
        assert_eq!(summary.added, vec![B.to_string()]);
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn xpath_and_css_on_same_url_are_different_targets() {
        let mut h = harness(&targets_json(&[A]));
        h.reconciler.start().await;
        h.reconciler.reconcile(vec![Target::with_selector(A, "p")]).await;

        let summary = h
            .reconciler
            .reconcile(vec![Target::with_xpath(A, "//p")])
            .await;
        assert_eq!(summary.replaced, vec![A.to_string()]);
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn plain_text_source_is_supported() {
        let mut h = harness(&format!("{A}\n\n{B}\n"));
        let summary = h.reconciler.start().await;
        assert_eq!(summary.added, vec![A.to_string(), B.to_string()]);
        h.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watch_loop_stops_removed_target_within_one_cycle() {
        let mut h = harness(&targets_json(&[A, B, C]));
        h.reconciler.start().await;

        let shutdown = CancellationToken::new();
        let web = h.web.clone();
        let outbox = h.outbox.clone();
        let path = h.path.clone();
        let driver = {
            let shutdown = shutdown.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                write(&path, &targets_json(&[A, C]));

                // One full watch interval later B must be gone.
                tokio::time::sleep(WATCH).await;
                let b_hits = web.hits(B);
                let a_hits = web.hits(A);
                tokio::time::sleep(Duration::from_secs(600)).await;
                assert_eq!(web.hits(B), b_hits, "B kept polling after removal");
                assert!(web.hits(A) > a_hits, "A stopped polling");
                assert!(outbox.sent().is_empty());
                shutdown.cancel();
            }
        };

        tokio::join!(h.reconciler.run(shutdown), driver);
        assert!(h.reconciler.running_urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn change_is_announced_through_running_monitor() {
        let mut h = harness(&targets_json(&[A, B]));
        h.reconciler.start().await;
        settle().await;

        h.web.set(A, "<p>price drop</p>");
        tokio::time::sleep(settings().check_interval).await;

        let sent = h.outbox.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with(A));
        assert_eq!(
            h.reconciler.last_fingerprint(A),
            Some(Fingerprint::of_text("price drop"))
        );
        h.reconciler.shutdown().await;
    }
}
