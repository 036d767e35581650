mod error;
pub mod fetch;
pub mod fingerprint;
mod monitor;
pub mod notify;
mod reconciler;
pub mod targets;
#[cfg(test)]
mod testing;

pub use error::{ExtractionError, FetchError, NotifyError, SourceError};
pub use fetch::{HttpFetcher, PageFetcher};
pub use fingerprint::{Fingerprint, fingerprint};
pub use monitor::{CycleOutcome, MonitorSettings, TargetMonitor};
pub use notify::{Notification, Notifier, SmtpNotifier};
pub use reconciler::{MonitorContext, ReconcileSummary, Reconciler};
pub use targets::{Selector, SourceMarker, Target, TargetSource};
