//! Shared fixtures for integration tests: a fake blog served by wiremock.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use blogcrawl_core::{ProgressEvent, ProgressSink};
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const BLOG: &str = "hiddenblog";

/// Photo post `id` whose single photo is served by `server`.
pub fn photo_post(server: &MockServer, id: u64) -> Value {
    json!({
        "id": id.to_string(),
        "type": "photo",
        "blog_name": BLOG,
        "blog": {"name": BLOG, "title": "Hidden Blog", "description": "quiet things"},
        "timestamp": 1_700_000_000 + i64::try_from(id).unwrap_or_default(),
        "tags": ["cats"],
        "photos": [{
            "caption": "",
            "alt_sizes": [{
                "url": media_url(server, id),
                "width": 1280,
                "height": 720
            }]
        }]
    })
}

pub fn media_url(server: &MockServer, id: u64) -> String {
    format!("{}/media/tumblr_post{id}_1280.jpg", server.uri())
}

pub fn page(posts: &[Value]) -> Value {
    json!({
        "meta": {"status": 200, "msg": "OK"},
        "response": {"posts": posts}
    })
}

/// Serves `posts` at `limit`/`offset`.
pub async fn mount_page(server: &MockServer, limit: u32, offset: u64, posts: &[Value]) {
    Mock::given(method("GET"))
        .and(path("/svc/indash_blog"))
        .and(query_param("limit", limit.to_string()))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(posts)))
        .mount(server)
        .await;
}

/// Serves a timeline of `ids` (newest first) for every offset of `page_size`,
/// plus the one-post probe used for discovery.
pub async fn mount_timeline(server: &MockServer, page_size: u32, ids: &[u64]) {
    let posts: Vec<Value> = ids.iter().map(|id| photo_post(server, *id)).collect();
    let size = usize::try_from(page_size).unwrap_or(1);
    for (index, chunk) in posts.chunks(size).enumerate() {
        let offset = u64::try_from(index * size).unwrap_or_default();
        mount_page(server, page_size, offset, chunk).await;
    }
    if let Some(first) = posts.first() {
        mount_page(server, 1, 0, std::slice::from_ref(first)).await;
    }
    mount_empty_fallback(server).await;
}

/// Any page not mounted explicitly is empty.
pub async fn mount_empty_fallback(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/svc/indash_blog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&[])))
        .with_priority(10)
        .mount(server)
        .await;
}

pub async fn mount_dashboard(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("/dashboard/blog/{BLOG}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><meta name="tumblr-form-key" id="tumblr_form_key" content="!1234|abcd"></head></html>"#,
        ))
        .mount(server)
        .await;
}

/// Media files for `ids`.
pub async fn mount_media(server: &MockServer, ids: &[u64]) {
    for id in ids {
        Mock::given(method("GET"))
            .and(path(format!("/media/tumblr_post{id}_1280.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("image {id}")))
            .mount(server)
            .await;
    }
}

/// Count of received page requests at `offset`/`limit`.
pub async fn page_requests(server: &MockServer, limit: u32, offset: u64) -> usize {
    let limit = format!("limit={limit}&");
    let offset = format!("offset={offset}&");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/svc/indash_blog")
        .filter(|r| {
            let query = r.url.query().unwrap_or_default();
            query.contains(&limit) && query.contains(&offset)
        })
        .count()
}

/// Progress sink that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| match e {
                        ProgressEvent::Error { message, .. } => Some(message.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
