//! In-memory remote used by the sync and mirror tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;

use crate::core::error::RemoteError;
use crate::core::remote::{ListPage, RawBody, RawHeader, RawMessage, RawPart, RemoteService};

#[derive(Debug, Clone)]
pub enum Failure {
    Always(RemoteError),
    Times(u32, RemoteError),
}

#[derive(Default)]
pub struct FakeRemote {
    /// Listing order, newest first like the real service.
    messages: Mutex<Vec<RawMessage>>,
    fetch_failures: Mutex<HashMap<String, Failure>>,
    /// Listing calls at or past this page index fail.
    fail_list_from_page: Mutex<Option<usize>>,
    pub fetch_delay: Option<Duration>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub queries: Mutex<Vec<Option<String>>>,
}

impl FakeRemote {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        FakeRemote {
            messages: Mutex::new(messages),
            ..Default::default()
        }
    }

    /// `count` messages from `from`, ids `m0..`, newest first.
    pub fn with_messages(count: usize, from: &str) -> Self {
        let messages = (0..count)
            .map(|i| {
                raw_message(
                    &format!("m{i}"),
                    from,
                    &format!("Subject {i}"),
                    &format!("Body of message {i}"),
                    1_700_000_000_000 - i as i64 * 1000,
                )
            })
            .collect();
        Self::new(messages)
    }

    pub fn fail_fetch(&self, id: &str, failure: Failure) {
        self.fetch_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        self.fetch_failures.lock().unwrap().clear();
    }

    pub fn fail_list_from_page(&self, page: usize) {
        *self.fail_list_from_page.lock().unwrap() = Some(page);
    }

    pub fn push_front(&self, message: RawMessage) {
        self.messages.lock().unwrap().insert(0, message);
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, id: &str) -> Option<RemoteError> {
        let mut failures = self.fetch_failures.lock().unwrap();
        match failures.get_mut(id)? {
            Failure::Always(e) => Some(e.clone()),
            Failure::Times(0, _) => None,
            Failure::Times(n, e) => {
                *n -= 1;
                Some(e.clone())
            }
        }
    }
}

impl RemoteService for FakeRemote {
    fn list<'a>(
        &'a self,
        query: Option<&'a str>,
        cursor: Option<&'a str>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<ListPage, RemoteError>> {
        Box::pin(async move {
            let page_index = self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.map(str::to_string));
            if self
                .fail_list_from_page
                .lock()
                .unwrap()
                .is_some_and(|from| page_index >= from)
            {
                return Err(RemoteError::Other("listing unavailable".into()));
            }

            let needle = query
                .and_then(|q| q.strip_prefix("from:"))
                .map(str::to_lowercase);
            let messages = self.messages.lock().unwrap();
            let matching: Vec<&RawMessage> = messages
                .iter()
                .filter(|m| match &needle {
                    Some(n) => m
                        .payload
                        .as_ref()
                        .and_then(|p| p.header("From"))
                        .is_some_and(|from| from.to_lowercase().contains(n.as_str())),
                    None => true,
                })
                .collect();

            let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (offset + page_size).min(matching.len());
            let ids = matching[offset.min(end)..end]
                .iter()
                .map(|m| m.id.clone())
                .collect();
            let next_cursor = (end < matching.len()).then(|| end.to_string());
            Ok(ListPage { ids, next_cursor })
        })
    }

    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<RawMessage, RemoteError>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(e) = self.take_failure(id) {
                return Err(e);
            }
            self.messages
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        })
    }
}

pub fn raw_message(id: &str, from: &str, subject: &str, body: &str, timestamp: i64) -> RawMessage {
    let header = |name: &str, value: &str| RawHeader {
        name: name.into(),
        value: value.into(),
    };
    RawMessage {
        id: id.into(),
        thread_id: format!("thread-{id}"),
        label_ids: vec!["INBOX".into()],
        snippet: body.chars().take(40).collect(),
        internal_date: Some(timestamp.to_string()),
        size_estimate: Some(body.len() as u64 + 200),
        payload: Some(RawPart {
            part_id: Some(String::new()),
            mime_type: "text/plain".into(),
            headers: vec![
                header("From", from),
                header("To", "me@example.net"),
                header("Subject", subject),
            ],
            body: RawBody {
                data: Some(base64::engine::general_purpose::URL_SAFE.encode(body)),
                size: body.len() as u64,
                attachment_id: None,
            },
            ..Default::default()
        }),
    }
}
