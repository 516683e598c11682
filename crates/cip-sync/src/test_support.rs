//! Scripted catalog and generator doubles shared by the sync tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cip_catalog::{CatalogApi, CatalogError, RawDetail, RawResult, ResultKind, SearchQuery};

use crate::pipeline::{ContentGenerator, GeneratedArtifact, GenerationError, ItemMetadata};

#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ok(T),
    Status(u16),
    Malformed,
}

impl<T: Clone> Reply<T> {
    fn into_result(self, what: &str) -> Result<T, CatalogError> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Status(status) => Err(CatalogError::Status {
                status,
                url: format!("test://{what}"),
                retryable: status == 429 || status >= 500,
            }),
            Reply::Malformed => Err(CatalogError::Malformed(format!("{what} is garbage"))),
        }
    }
}

/// Replies are consumed front to back; the last one repeats forever.
#[derive(Default)]
pub struct ScriptedCatalog {
    searches: Mutex<HashMap<String, Vec<Reply<Vec<RawResult>>>>>,
    details: Mutex<HashMap<String, Vec<Reply<RawDetail>>>>,
    aggregates: Mutex<HashMap<String, Vec<Reply<String>>>>,
    detail_calls: Mutex<HashMap<String, usize>>,
}

fn next_reply<T: Clone>(
    script: &Mutex<HashMap<String, Vec<Reply<T>>>>,
    key: &str,
) -> Option<Reply<T>> {
    let mut script = script.lock().unwrap();
    let replies = script.get_mut(key)?;
    if replies.len() > 1 {
        Some(replies.remove(0))
    } else {
        replies.first().cloned()
    }
}

impl ScriptedCatalog {
    pub fn search(&self, query: &str, replies: Vec<Reply<Vec<RawResult>>>) -> &Self {
        self.searches.lock().unwrap().insert(query.to_string(), replies);
        self
    }

    pub fn detail(&self, id: &str, replies: Vec<Reply<RawDetail>>) -> &Self {
        self.details.lock().unwrap().insert(id.to_string(), replies);
        self
    }

    pub fn aggregate(&self, id: &str, replies: Vec<Reply<String>>) -> &Self {
        self.aggregates.lock().unwrap().insert(id.to_string(), replies);
        self
    }

    pub fn detail_calls(&self, id: &str) -> usize {
        self.detail_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CatalogApi for ScriptedCatalog {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawResult>, CatalogError> {
        next_reply(&self.searches, &query.query)
            .unwrap_or(Reply::Ok(Vec::new()))
            .into_result(&query.query)
    }

    async fn fetch_detail(&self, id: &str) -> Result<RawDetail, CatalogError> {
        *self.detail_calls.lock().unwrap().entry(id.to_string()).or_default() += 1;
        next_reply(&self.details, id)
            .unwrap_or_else(|| Reply::Ok(detail(id)))
            .into_result(id)
    }

    async fn resolve_aggregate(&self, aggregate_id: &str) -> Result<String, CatalogError> {
        next_reply(&self.aggregates, aggregate_id)
            .unwrap_or(Reply::Status(404))
            .into_result(aggregate_id)
    }
}

pub fn detail(id: &str) -> RawDetail {
    RawDetail {
        id: id.to_string(),
        title: format!("Release {id}"),
        artists: Vec::new(),
        year: Some(1998),
        formats: Vec::new(),
        genres: vec!["Electronic".into()],
        styles: Vec::new(),
        tracklist: Vec::new(),
        notes: None,
    }
}

pub fn release(id: &str, title: &str, formats: &[&str]) -> RawResult {
    RawResult {
        id: id.to_string(),
        kind: ResultKind::Release,
        title: title.to_string(),
        year: Some(1998),
        format: formats.iter().map(|f| f.to_string()).collect(),
        master_id: None,
    }
}

pub fn master(id: &str, title: &str, formats: &[&str]) -> RawResult {
    RawResult {
        kind: ResultKind::Master,
        ..release(id, title, formats)
    }
}

/// Returns `art-{external_id}` after an optional delay; ids listed in
/// `failures` fail with the given retryability.
#[derive(Default)]
pub struct FakeGenerator {
    pub delay: Duration,
    pub failures: HashMap<String, bool>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(&self, metadata: &ItemMetadata) -> Result<GeneratedArtifact, GenerationError> {
        self.calls.lock().unwrap().push(metadata.external_id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.failures.get(&metadata.external_id) {
            Some(&retryable) => Err(GenerationError {
                message: format!("generator refused {}", metadata.external_id),
                retryable,
            }),
            None => Ok(GeneratedArtifact {
                artifact_id: format!("art-{}", metadata.external_id),
            }),
        }
    }
}
