//! The remote store as seen by the mirror: a paginated id listing plus
//! fetch-by-id. Transport and authentication live behind this trait.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::error::RemoteError;

/// One page of a remote listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage {
    pub ids: Vec<String>,
    pub next_cursor: Option<String>,
}

pub trait RemoteService: Send + Sync {
    fn list<'a>(
        &'a self,
        query: Option<&'a str>,
        cursor: Option<&'a str>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<ListPage, RemoteError>>;

    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<RawMessage, RemoteError>>;
}

/// A fetched message in the remote's structured form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub size_estimate: Option<u64>,
    #[serde(default)]
    pub payload: Option<RawPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<RawHeader>,
    #[serde(default)]
    pub body: RawBody,
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

impl RawPart {
    /// Case-insensitive header lookup; first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBody {
    /// URL-safe base64 payload.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub attachment_id: Option<String>,
}
