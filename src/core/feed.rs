//! Bluesky feed client over the public XRPC surface.
//!
//! Only three calls are used: `com.atproto.server.createSession` for login,
//! `app.bsky.feed.getAuthorFeed` for backward pagination over a handle's
//! timeline, and `app.bsky.feed.getPosts` for the out-of-band single-post
//! fetch behind `skywatch test`.

use crate::core::error::SkywatchError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Upstream cap on getAuthorFeed page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Blocking delay between feed calls, to stay under upstream rate limits.
pub const RATE_DELAY: Duration = Duration::from_secs(10);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One post as fetched from the feed. Immutable after fetch.
#[derive(Debug, Clone)]
pub struct Post {
    pub uri: String,
    pub author_handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Browser URL for the post, derived from its at:// uri.
    /// `at://did:plc:xyz/app.bsky.feed.post/3kabc` becomes
    /// `https://bsky.app/profile/<handle>/post/3kabc`.
    pub fn web_url(&self) -> String {
        if self.uri.starts_with("at://") {
            if let Some(rkey) = self.uri.rsplit('/').next() {
                if !rkey.is_empty() {
                    return format!(
                        "https://bsky.app/profile/{}/post/{}",
                        self.author_handle, rkey
                    );
                }
            }
        }
        self.uri.clone()
    }
}

/// One page of posts, newest first, plus the opaque cursor for the next
/// (older) page. `cursor` is `None` when the feed is exhausted.
#[derive(Debug, Default)]
pub struct Page {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
}

/// The pagination seam the scan engine drives. Implemented by [`FeedClient`]
/// and by in-memory fakes in tests.
pub trait FeedSource {
    fn fetch_page(
        &mut self,
        handle: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SkywatchError>;
}

// Wire shapes. Bluesky uses camelCase field names.

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "accessJwt")]
    access_jwt: String,
}

#[derive(Debug, Deserialize)]
struct AuthorFeedResponse {
    feed: Vec<FeedItem>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    post: PostView,
}

#[derive(Debug, Deserialize)]
struct PostView {
    uri: String,
    author: AuthorView,
    record: PostRecord,
}

#[derive(Debug, Deserialize)]
struct AuthorView {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    posts: Vec<PostView>,
}

impl From<PostView> for Post {
    fn from(view: PostView) -> Self {
        Post {
            uri: view.uri,
            author_handle: view.author.handle,
            text: view.record.text,
            created_at: view.record.created_at,
        }
    }
}

fn describe(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, resp) => format!("HTTP {} {}", code, resp.status_text()),
        ureq::Error::Transport(t) => t.to_string(),
    }
}

pub struct FeedClient {
    agent: ureq::Agent,
    service: String,
    access_jwt: Option<String>,
    rate_delay: Duration,
    fetched_once: bool,
}

impl FeedClient {
    pub fn new(service: &str) -> Self {
        Self::with_rate_delay(service, RATE_DELAY)
    }

    pub fn with_rate_delay(service: &str, rate_delay: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        FeedClient {
            agent,
            service: service.trim_end_matches('/').to_string(),
            access_jwt: None,
            rate_delay,
            fetched_once: false,
        }
    }

    /// Credentials are shared across scans, so a failure here is fatal to the
    /// whole invocation.
    pub fn login(&mut self, identifier: &str, password: &str) -> Result<(), SkywatchError> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.service);
        let resp = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({
                "identifier": identifier,
                "password": password,
            }))
            .map_err(|e| SkywatchError::Auth(format!("createSession: {}", describe(e))))?;
        let session: SessionResponse = resp
            .into_json()
            .map_err(|e| SkywatchError::Auth(format!("createSession response: {}", e)))?;
        self.access_jwt = Some(session.access_jwt);
        Ok(())
    }

    /// Block for the rate delay before every call after the first.
    fn pace(&mut self) {
        if self.fetched_once && !self.rate_delay.is_zero() {
            std::thread::sleep(self.rate_delay);
        }
        self.fetched_once = true;
    }

    fn authed_get(&self, url: &str) -> ureq::Request {
        let req = self.agent.get(url);
        match &self.access_jwt {
            Some(jwt) => req.set("Authorization", &format!("Bearer {}", jwt)),
            None => req,
        }
    }

    /// Fetch a single post by at:// uri, outside any scan cursor.
    pub fn get_post(&mut self, uri: &str) -> Result<Post, SkywatchError> {
        self.pace();
        let url = format!("{}/xrpc/app.bsky.feed.getPosts", self.service);
        let resp = self
            .authed_get(&url)
            .query("uris", uri)
            .call()
            .map_err(|e| SkywatchError::Client(format!("getPosts: {}", describe(e))))?;
        let body: PostsResponse = resp
            .into_json()
            .map_err(|e| SkywatchError::Client(format!("getPosts response: {}", e)))?;
        body.posts
            .into_iter()
            .next()
            .map(Post::from)
            .ok_or_else(|| SkywatchError::NotFound(format!("post not found: {}", uri)))
    }
}

impl FeedSource for FeedClient {
    fn fetch_page(
        &mut self,
        handle: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page, SkywatchError> {
        self.pace();
        let url = format!("{}/xrpc/app.bsky.feed.getAuthorFeed", self.service);
        let mut req = self
            .authed_get(&url)
            .query("actor", handle)
            .query("limit", &limit.min(MAX_PAGE_SIZE).to_string());
        if let Some(c) = cursor {
            req = req.query("cursor", c);
        }
        let resp = req.call().map_err(|e| {
            SkywatchError::Client(format!("getAuthorFeed for {}: {}", handle, describe(e)))
        })?;
        let body: AuthorFeedResponse = resp
            .into_json()
            .map_err(|e| SkywatchError::Client(format!("getAuthorFeed response: {}", e)))?;
        Ok(Page {
            posts: body.feed.into_iter().map(|item| Post::from(item.post)).collect(),
            cursor: body.cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHOR_FEED_BODY: &str = r#"{
        "feed": [
            {
                "post": {
                    "uri": "at://did:plc:abc123/app.bsky.feed.post/3kfffnewest",
                    "cid": "bafyrei-newest",
                    "author": { "did": "did:plc:abc123", "handle": "alice.example.com" },
                    "record": { "text": "Bitcoin just moved", "createdAt": "2026-08-23T11:30:00.000Z" }
                }
            },
            {
                "post": {
                    "uri": "at://did:plc:abc123/app.bsky.feed.post/3kfffolder",
                    "cid": "bafyrei-older",
                    "author": { "did": "did:plc:abc123", "handle": "alice.example.com" },
                    "record": { "createdAt": "2026-08-23T10:00:00+00:00" }
                }
            }
        ],
        "cursor": "2026-08-23T10:00:00Z::bafyrei-older"
    }"#;

    #[test]
    fn test_author_feed_decodes_newest_first() {
        let body: AuthorFeedResponse = serde_json::from_str(AUTHOR_FEED_BODY).unwrap();
        let page = Page {
            posts: body.feed.into_iter().map(|i| Post::from(i.post)).collect(),
            cursor: body.cursor,
        };
        assert_eq!(page.posts.len(), 2);
        assert_eq!(page.posts[0].text, "Bitcoin just moved");
        assert_eq!(page.posts[0].author_handle, "alice.example.com");
        // Posts may omit text entirely; treated as empty, never an error.
        assert_eq!(page.posts[1].text, "");
        assert!(page.posts[0].created_at > page.posts[1].created_at);
        assert_eq!(
            page.cursor.as_deref(),
            Some("2026-08-23T10:00:00Z::bafyrei-older")
        );
    }

    #[test]
    fn test_exhausted_feed_has_no_cursor() {
        let body: AuthorFeedResponse = serde_json::from_str(r#"{ "feed": [] }"#).unwrap();
        assert!(body.feed.is_empty());
        assert!(body.cursor.is_none());
    }

    #[test]
    fn test_web_url_from_at_uri() {
        let post = Post {
            uri: "at://did:plc:abc123/app.bsky.feed.post/3kfffnewest".to_string(),
            author_handle: "alice.example.com".to_string(),
            text: String::new(),
            created_at: Utc::now(),
        };
        assert_eq!(
            post.web_url(),
            "https://bsky.app/profile/alice.example.com/post/3kfffnewest"
        );
    }

    #[test]
    fn test_web_url_falls_back_to_uri() {
        let post = Post {
            uri: "https://example.com/whatever".to_string(),
            author_handle: "alice.example.com".to_string(),
            text: String::new(),
            created_at: Utc::now(),
        };
        assert_eq!(post.web_url(), "https://example.com/whatever");
    }
}
