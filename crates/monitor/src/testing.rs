//! In-memory fetcher and notifier used by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchError, NotifyError};
use crate::fetch::PageFetcher;
use crate::monitor::MonitorSettings;
use crate::notify::{Notification, Notifier};

#[derive(Clone)]
pub(crate) enum Page {
    Body(String),
    Status(u16),
    /// Never answers; only the monitor's timeout ends the fetch.
    Hang,
}

/// Serves whatever page is currently set for a URL and counts requests.
#[derive(Default)]
pub(crate) struct FakeWeb {
    pages: Mutex<HashMap<String, Page>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl FakeWeb {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set(&self, url: &str, body: &str) {
        self.set_page(url, Page::Body(body.to_string()));
    }

    pub(crate) fn set_page(&self, url: &str, page: Page) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub(crate) fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for FakeWeb {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let page = self.pages.lock().unwrap().get(url).cloned();
        match page {
            Some(Page::Body(body)) => Ok(body),
            Some(Page::Status(code)) => Err(FetchError::Status(code)),
            Some(Page::Hang) => std::future::pending().await,
            None => Err(FetchError::Status(404)),
        }
    }
}

/// Records every notification; optionally reports failure for each one.
#[derive(Default)]
pub(crate) struct Outbox {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

impl Outbox {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub(crate) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.failing {
            Err(NotifyError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

pub(crate) fn settings() -> MonitorSettings {
    MonitorSettings {
        check_interval: Duration::from_secs(60),
        fetch_timeout: Duration::from_secs(10),
    }
}
