//! Notification dispatch: batch webhook POST and per-match shell execution.
//!
//! Both channels are best-effort. Failures come back as warning strings and
//! never abort the scan that produced them.

use crate::core::config::ScanConfig;
use crate::core::error::SkywatchError;
use crate::core::feed::Post;
use serde::Serialize;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// One matched post, with the exact field names the webhook payload and the
/// shell template expose.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub handle: String,
    pub created_at: String,
    pub text: String,
    pub pattern: String,
    pub uri: String,
    pub url: String,
}

impl MatchResult {
    pub fn from_post(post: &Post, pattern: &str) -> Self {
        MatchResult {
            handle: post.author_handle.clone(),
            created_at: post.created_at.to_rfc3339(),
            text: post.text.clone(),
            pattern: pattern.to_string(),
            uri: post.uri.clone(),
            url: post.web_url(),
        }
    }
}

/// Everything one scan run found, sent as a single webhook POST.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub scan_name: String,
    pub matches: Vec<MatchResult>,
    pub total_matches: usize,
    pub scanned_posts: usize,
}

impl NotificationPayload {
    pub fn new(scan_name: &str, matches: Vec<MatchResult>, scanned_posts: usize) -> Self {
        NotificationPayload {
            scan_name: scan_name.to_string(),
            total_matches: matches.len(),
            matches,
            scanned_posts,
        }
    }
}

/// Dispatch seam the engine calls once per scan run with matches. Returns
/// warnings; an empty vec means every configured channel delivered.
pub trait Notify {
    fn dispatch(&self, scan: &ScanConfig, payload: &NotificationPayload) -> Vec<String>;
}

/// Wrap a value in single quotes with embedded quotes escaped, so the shell
/// sees it as one opaque word no matter what the post text contains.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn field_value<'a>(m: &'a MatchResult, key: &str) -> Option<&'a str> {
    match key {
        "text" => Some(&m.text),
        "created_at" => Some(&m.created_at),
        "handle" => Some(&m.handle),
        "pattern" => Some(&m.pattern),
        "uri" => Some(&m.uri),
        "url" => Some(&m.url),
        _ => None,
    }
}

/// Substitute recognized `{field}` placeholders with their quoted values in a
/// single pass. Field values are never re-scanned for placeholders, and
/// unrecognized braces pass through untouched, so operator-written shell
/// syntax in the template executes as written.
pub fn render_template(template: &str, m: &MatchResult) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}') {
            Some(end) => match field_value(m, &tail[1..end]) {
                Some(value) => {
                    out.push_str(&shell_quote(value));
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            },
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct Notifier {
    agent: ureq::Agent,
    shell_timeout: Duration,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_shell_timeout(NOTIFY_TIMEOUT)
    }

    pub fn with_shell_timeout(shell_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(NOTIFY_TIMEOUT).build();
        Notifier {
            agent,
            shell_timeout,
        }
    }

    fn post_webhook(&self, url: &str, payload: &NotificationPayload) -> Result<(), SkywatchError> {
        self.agent
            .post(url)
            .send_json(payload)
            .map_err(|e| match e {
                ureq::Error::Status(code, resp) => SkywatchError::Notify(format!(
                    "webhook {} returned HTTP {} {}",
                    url,
                    code,
                    resp.status_text()
                )),
                ureq::Error::Transport(t) => {
                    SkywatchError::Notify(format!("webhook {}: {}", url, t))
                }
            })?;
        Ok(())
    }

    fn run_shell(&self, scan: &ScanConfig, rendered: &str) -> Result<(), SkywatchError> {
        let mut child = Command::new(&scan.shell_executable)
            .arg("-c")
            .arg(rendered)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SkywatchError::Notify(format!("failed to spawn {}: {}", scan.shell_executable, e))
            })?;

        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                let output = child.wait_with_output()?;
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(SkywatchError::Notify(format!(
                    "shell command exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
            if start.elapsed() > self.shell_timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SkywatchError::Notify(format!(
                    "shell command timed out after {:?}",
                    self.shell_timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notify for Notifier {
    fn dispatch(&self, scan: &ScanConfig, payload: &NotificationPayload) -> Vec<String> {
        let mut warnings = Vec::new();
        if payload.matches.is_empty() {
            return warnings;
        }
        if let Some(url) = &scan.webhook_url {
            if let Err(e) = self.post_webhook(url, payload) {
                warnings.push(e.to_string());
            }
        }
        if let Some(template) = &scan.shell {
            for m in &payload.matches {
                let rendered = render_template(template, m);
                if let Err(e) = self.run_shell(scan, &rendered) {
                    warnings.push(e.to_string());
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_match(text: &str) -> MatchResult {
        MatchResult {
            handle: "alice.example.com".to_string(),
            created_at: "2026-08-23T11:30:00+00:00".to_string(),
            text: text.to_string(),
            pattern: "bitcoin|crypto".to_string(),
            uri: "at://did:plc:abc/app.bsky.feed.post/3k1".to_string(),
            url: "https://bsky.app/profile/alice.example.com/post/3k1".to_string(),
        }
    }

    fn shell_scan(template: &str) -> ScanConfig {
        ScanConfig {
            name: "t".to_string(),
            handle: "alice.example.com".to_string(),
            pattern: "bitcoin".to_string(),
            webhook_url: None,
            shell: Some(template.to_string()),
            shell_executable: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn test_render_substitutes_all_fields_quoted() {
        let m = sample_match("hello world");
        let rendered = render_template("notify {handle} {created_at} {text} {pattern} {uri} {url}", &m);
        assert!(rendered.contains("'alice.example.com'"));
        assert!(rendered.contains("'hello world'"));
        assert!(rendered.contains("'bitcoin|crypto'"));
        assert!(rendered.contains("'at://did:plc:abc/app.bsky.feed.post/3k1'"));
    }

    #[test]
    fn test_render_preserves_unknown_braces_and_shell_syntax() {
        let m = sample_match("x");
        let rendered = render_template("echo {text} | tee ${LOG:-/tmp/log} {nope}", &m);
        assert_eq!(rendered, "echo 'x' | tee ${LOG:-/tmp/log} {nope}");
    }

    #[test]
    fn test_field_value_inside_post_text_is_not_expanded() {
        let m = sample_match("mentions {handle} literally");
        let rendered = render_template("echo {text}", &m);
        assert_eq!(rendered, "echo 'mentions {handle} literally'");
    }

    #[test]
    fn test_injection_attempt_stays_one_argument() {
        let m = sample_match("hello; rm -rf /tmp/x");
        let rendered = render_template("printf %s {text}", &m);
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&rendered)
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "hello; rm -rf /tmp/x"
        );
    }

    #[test]
    fn test_single_quotes_in_text_cannot_escape() {
        let m = sample_match("it's '; touch /tmp/pwned; echo 'done");
        let rendered = render_template("printf %s {text}", &m);
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&rendered)
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "it's '; touch /tmp/pwned; echo 'done"
        );
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = NotificationPayload::new("crypto_watch", vec![sample_match("bitcoin up")], 3);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["scan_name"], "crypto_watch");
        assert_eq!(value["total_matches"], 1);
        assert_eq!(value["scanned_posts"], 3);
        let entry = &value["matches"][0];
        for key in ["handle", "created_at", "text", "pattern", "uri", "url"] {
            assert!(entry.get(key).is_some(), "missing payload key {}", key);
        }
    }

    #[test]
    fn test_dispatch_shell_success_and_failure() {
        let notifier = Notifier::new();
        let payload = NotificationPayload::new("t", vec![sample_match("bitcoin")], 1);
        assert!(notifier.dispatch(&shell_scan("true"), &payload).is_empty());
        let warnings = notifier.dispatch(&shell_scan("exit 3"), &payload);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("exited"));
    }

    #[test]
    fn test_dispatch_shell_timeout_is_warning() {
        let notifier = Notifier::with_shell_timeout(Duration::from_millis(150));
        let payload = NotificationPayload::new("t", vec![sample_match("bitcoin")], 1);
        let warnings = notifier.dispatch(&shell_scan("sleep 5"), &payload);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("timed out"));
    }

    #[test]
    fn test_one_match_failure_does_not_block_the_next() {
        let notifier = Notifier::new();
        let payload = NotificationPayload::new(
            "t",
            vec![sample_match("bitcoin one"), sample_match("bitcoin two")],
            2,
        );
        // `false` fails for every match; both failures are reported.
        let warnings = notifier.dispatch(&shell_scan("false"), &payload);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_no_matches_no_dispatch() {
        let notifier = Notifier::new();
        let payload = NotificationPayload::new("t", Vec::new(), 4);
        assert!(notifier.dispatch(&shell_scan("exit 9"), &payload).is_empty());
    }

    #[test]
    fn test_match_result_from_post() {
        let post = Post {
            uri: "at://did:plc:abc/app.bsky.feed.post/3k9".to_string(),
            author_handle: "bob.example.com".to_string(),
            text: "crypto crash".to_string(),
            created_at: Utc::now(),
        };
        let m = MatchResult::from_post(&post, "crypto");
        assert_eq!(m.handle, "bob.example.com");
        assert_eq!(m.pattern, "crypto");
        assert_eq!(m.url, "https://bsky.app/profile/bob.example.com/post/3k9");
    }
}
