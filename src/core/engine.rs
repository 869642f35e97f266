//! The incremental scan engine.
//!
//! One run of a scan pages backward through the handle's timeline until it
//! crosses the dedup boundary, matches the collected posts in chronological
//! order, dispatches notifications and commits the new boundary. The boundary
//! is committed only after the whole paginate/match/notify sequence, so an
//! interrupted run leaves the prior cursor intact and is simply retried in
//! full on the next invocation.

use crate::core::config::ScanConfig;
use crate::core::error::SkywatchError;
use crate::core::feed::{FeedSource, Post};
use crate::core::matcher::PatternMatcher;
use crate::core::notify::{MatchResult, NotificationPayload, Notify};
use crate::core::state::{Boundary, StateStore};
use chrono::{DateTime, TimeDelta, Utc};

/// Worst-case backlog cap: a scan with no prior cursor never reaches further
/// back than this.
pub const LOOKBACK_HOURS: i64 = 24;

pub const PAGE_SIZE: u32 = 100;

#[derive(Debug)]
pub struct ScanReport {
    pub scan_name: String,
    pub scanned_posts: usize,
    pub matches: Vec<MatchResult>,
    pub warnings: Vec<String>,
    pub committed: bool,
    pub error: Option<String>,
}

impl ScanReport {
    fn empty(scan_name: &str) -> Self {
        ScanReport {
            scan_name: scan_name.to_string(),
            scanned_posts: 0,
            matches: Vec::new(),
            warnings: Vec::new(),
            committed: false,
            error: None,
        }
    }

    fn aborted(scan_name: &str, error: String) -> Self {
        ScanReport {
            error: Some(error),
            ..Self::empty(scan_name)
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

pub struct ScanEngine<'a, F: FeedSource, N: Notify> {
    feed: &'a mut F,
    store: &'a StateStore,
    notifier: &'a N,
    commit_on_notify_failure: bool,
}

impl<'a, F: FeedSource, N: Notify> ScanEngine<'a, F, N> {
    pub fn new(
        feed: &'a mut F,
        store: &'a StateStore,
        notifier: &'a N,
        commit_on_notify_failure: bool,
    ) -> Self {
        ScanEngine {
            feed,
            store,
            notifier,
            commit_on_notify_failure,
        }
    }

    /// Run every scan in order. Pattern compilation happens for the whole
    /// batch before the first network call; after that, a failure in one scan
    /// is contained to its report and the remaining scans still run.
    pub fn run_all(&mut self, scans: &[&ScanConfig]) -> Result<Vec<ScanReport>, SkywatchError> {
        let mut matchers = Vec::with_capacity(scans.len());
        for scan in scans {
            matchers.push(PatternMatcher::compile(&scan.pattern)?);
        }
        let mut reports = Vec::with_capacity(scans.len());
        for (scan, matcher) in scans.iter().zip(matchers.iter()) {
            match self.run_scan(scan, matcher) {
                Ok(report) => reports.push(report),
                Err(e @ SkywatchError::Auth(_)) => return Err(e),
                Err(e) => reports.push(ScanReport::aborted(&scan.name, e.to_string())),
            }
        }
        Ok(reports)
    }

    pub fn run_scan(
        &mut self,
        scan: &ScanConfig,
        matcher: &PatternMatcher,
    ) -> Result<ScanReport, SkywatchError> {
        self.run_scan_at(scan, matcher, Utc::now())
    }

    /// Same as [`run_scan`](Self::run_scan) with an explicit clock, so the
    /// lookback floor is deterministic under test.
    pub fn run_scan_at(
        &mut self,
        scan: &ScanConfig,
        matcher: &PatternMatcher,
        now: DateTime<Utc>,
    ) -> Result<ScanReport, SkywatchError> {
        let prior = self.store.get(&scan.name)?;
        let stored_boundary = prior.as_ref().map(|s| s.last_boundary_created_at);
        let floor = now - TimeDelta::hours(LOOKBACK_HOURS);
        let boundary = stored_boundary.map_or(floor, |ts| ts.max(floor));

        let scanned = self.paginate(scan, boundary)?;
        // The new boundary is the newest *scanned* post, matching or not, so
        // non-matching posts are not re-scanned next run.
        let new_boundary = match scanned.last() {
            Some(post) => Boundary {
                created_at: post.created_at,
                uri: post.uri.clone(),
            },
            None => {
                self.store.touch_run(&scan.name, now)?;
                return Ok(ScanReport::empty(&scan.name));
            }
        };

        let mut matches = Vec::new();
        for post in &scanned {
            if !matcher.is_match(&post.text) {
                continue;
            }
            // The feed can re-return a post sitting exactly on a previously
            // stored boundary; never re-notify it.
            if let Some(stored) = stored_boundary {
                if post.created_at <= stored {
                    continue;
                }
            }
            matches.push(MatchResult::from_post(post, matcher.pattern()));
        }

        let payload = NotificationPayload::new(&scan.name, matches.clone(), scanned.len());
        let warnings = if payload.matches.is_empty() {
            Vec::new()
        } else {
            self.notifier.dispatch(scan, &payload)
        };

        let committed = warnings.is_empty() || self.commit_on_notify_failure;
        if committed {
            self.store.commit(&scan.name, &scan.handle, &new_boundary, now)?;
        } else {
            self.store.touch_run(&scan.name, now)?;
        }

        Ok(ScanReport {
            scan_name: scan.name.clone(),
            scanned_posts: scanned.len(),
            matches,
            warnings,
            committed,
            error: None,
        })
    }

    /// Page backward (newest first) until a post at or older than the
    /// boundary appears, the cursor runs out, or a page comes back empty.
    /// Returns the posts strictly newer than the boundary, reordered oldest
    /// first for deterministic notification ordering.
    fn paginate(
        &mut self,
        scan: &ScanConfig,
        boundary: DateTime<Utc>,
    ) -> Result<Vec<Post>, SkywatchError> {
        let mut collected: Vec<Post> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .feed
                .fetch_page(&scan.handle, cursor.as_deref(), PAGE_SIZE)?;
            if page.posts.is_empty() {
                break;
            }
            let mut crossed = false;
            for post in page.posts {
                if post.created_at <= boundary {
                    crossed = true;
                    break;
                }
                collected.push(post);
            }
            if crossed {
                break;
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        collected.reverse();
        Ok(collected)
    }
}
