use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::RunLimits;
use crate::llm::tool_execution::dispatch::ToolResult;
use crate::llm::types::{ChatMessage, ContentPart, ImageUrlPart, MessageContent};

/// Stand-in left inside a cleaned tool result where an image payload was.
pub const IMAGE_PLACEHOLDER: &str =
    "[image payload removed; the screenshot is attached to the conversation separately]";

/// Caption of the rolling-screenshot user turn this module appends.
pub(crate) const SCREENSHOT_CAPTION: &str = "Recent screenshots, oldest first, newest last:";

/// A base64 payload with no image marker at all is still treated as an image
/// once it crosses this size.
const BARE_PAYLOAD_THRESHOLD: usize = 65_536;

/// Minimum plausible payload length for a key-name match alone.
const KEY_MATCH_MIN_LEN: usize = 256;

const BASE64_MAGICS: &[(&str, &str)] = &[
    ("iVBORw0KGgo", "image/png"),
    ("/9j/", "image/jpeg"),
    ("R0lGOD", "image/gif"),
    ("UklGR", "image/webp"),
];

/// An image payload lifted out of a tool result, normalized to a URL the
/// chat API accepts inside a `user` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
}

impl ImageRef {
    /// Cheap prefix hash for duplicate-frame detection.
    pub fn fingerprint(&self) -> [u8; 32] {
        let prefix_len = self.url.len().min(4096);
        let mut hasher = Sha256::new();
        hasher.update(&self.url.as_bytes()[..prefix_len]);
        hasher.finalize().into()
    }
}

fn magic_mime(value: &str) -> Option<&'static str> {
    BASE64_MAGICS
        .iter()
        .find(|(magic, _)| value.starts_with(magic))
        .map(|(_, mime)| *mime)
}

fn key_has_image_marker(key: Option<&str>) -> bool {
    key.map(|k| {
        let k = k.to_ascii_lowercase();
        k.contains("image") || k.contains("screenshot")
    })
    .unwrap_or(false)
}

/// Probe the head of a suspected payload; prose under an image-ish key must
/// not be swallowed.
fn plausibly_base64(value: &str) -> bool {
    use base64::Engine;
    let probe_len = value.len().min(512) & !3;
    if probe_len == 0 {
        return false;
    }
    base64::engine::general_purpose::STANDARD
        .decode(&value.as_bytes()[..probe_len])
        .is_ok()
}

fn image_like(key: Option<&str>, value: &str) -> bool {
    if value == IMAGE_PLACEHOLDER {
        return false;
    }
    if value.starts_with("data:image/") || magic_mime(value).is_some() {
        return true;
    }
    if key_has_image_marker(key) {
        if value.starts_with("http://") || value.starts_with("https://") {
            return true;
        }
        return value.len() >= KEY_MATCH_MIN_LEN && plausibly_base64(value);
    }
    value.len() > BARE_PAYLOAD_THRESHOLD && plausibly_base64(value)
}

fn normalize_payload(value: &str) -> ImageRef {
    let url = if value.starts_with("data:")
        || value.starts_with("http://")
        || value.starts_with("https://")
    {
        value.to_string()
    } else {
        let mime = magic_mime(value).unwrap_or("image/png");
        format!("data:{mime};base64,{value}")
    };
    ImageRef { url }
}

fn clean_value(
    value: serde_json::Value,
    key: Option<&str>,
    found: &mut Vec<ImageRef>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            if image_like(key, &s) {
                found.push(normalize_payload(&s));
                serde_json::Value::String(IMAGE_PLACEHOLDER.to_string())
            } else {
                serde_json::Value::String(s)
            }
        }
        serde_json::Value::Object(map) => {
            let cleaned = map
                .into_iter()
                .map(|(k, v)| {
                    let cleaned = clean_value(v, Some(&k), found);
                    (k, cleaned)
                })
                .collect();
            serde_json::Value::Object(cleaned)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .map(|v| clean_value(v, key, found))
                .collect(),
        ),
        other => other,
    }
}

/// Strip image payloads from a tool result, replacing each with
/// [`IMAGE_PLACEHOLDER`]. Returns the cleaned result and the first extracted
/// image, if any. Running this on an already-cleaned result is a no-op.
pub fn extract_image(result: serde_json::Value) -> (serde_json::Value, Option<ImageRef>) {
    let mut found = Vec::new();
    let cleaned = clean_value(result, None, &mut found);
    if found.len() > 1 {
        debug!(
            extra = found.len() - 1,
            "tool result carried multiple image payloads; keeping the first"
        );
    }
    let image = found.into_iter().next();
    (cleaned, image)
}

/// Bounded FIFO of the most recent screenshots, shared across iterations of
/// one run. Tracks consecutive identical frames.
#[derive(Debug)]
pub struct ScreenshotHistory {
    images: VecDeque<ImageRef>,
    capacity: usize,
    alert_threshold: u32,
    last_fingerprint: Option<[u8; 32]>,
    duplicate_run: u32,
}

impl ScreenshotHistory {
    pub fn new(capacity: usize, alert_threshold: u32) -> Self {
        Self {
            images: VecDeque::with_capacity(capacity),
            capacity,
            alert_threshold,
            last_fingerprint: None,
            duplicate_run: 0,
        }
    }

    /// Push a frame, evicting the oldest beyond capacity. Returns true when
    /// this frame makes the duplicate-run counter reach the alert threshold,
    /// i.e. the acting tool appears to have no visible effect.
    pub fn push(&mut self, image: ImageRef) -> bool {
        let fp = image.fingerprint();
        if self.last_fingerprint == Some(fp) {
            self.duplicate_run += 1;
        } else {
            self.duplicate_run = 1;
        }
        self.last_fingerprint = Some(fp);

        if self.images.len() == self.capacity && self.capacity > 0 {
            self.images.pop_front();
        }
        if self.capacity > 0 {
            self.images.push_back(image);
        }

        let tripped = self.duplicate_run == self.alert_threshold;
        if tripped {
            warn!(
                run = self.duplicate_run,
                "screen appears frozen: identical frames in a row"
            );
        }
        tripped
    }

    pub fn duplicate_run(&self) -> u32 {
        self.duplicate_run
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageRef> {
        self.images.iter()
    }
}

/// Append one `tool` message per result, cleaned content, in the exact order
/// the calls were issued. Protocol requires every tool response for a model
/// turn to precede the next user/assistant turn.
pub fn append_tool_responses(transcript: &mut Vec<ChatMessage>, results: &[ToolResult]) {
    for result in results {
        let content = serde_json::to_string(&result.cleaned)
            .unwrap_or_else(|e| format!("{{\"error\":\"failed to serialize tool result: {e}\"}}"));
        transcript.push(ChatMessage::tool(
            result.call_id.clone(),
            result.tool_name.clone(),
            content,
        ));
    }
}

/// After all tool responses are appended, attach ONE `user` turn carrying the
/// whole rolling history, giving the model visual continuity rather than only
/// the latest frame.
pub fn inject_collected_images(transcript: &mut Vec<ChatMessage>, history: &ScreenshotHistory) {
    if history.is_empty() {
        return;
    }
    let mut parts = Vec::with_capacity(history.len() + 1);
    parts.push(ContentPart::Text {
        text: SCREENSHOT_CAPTION.to_string(),
    });
    for image in history.iter() {
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrlPart {
                url: image.url.clone(),
            },
        });
    }
    transcript.push(ChatMessage::user_parts(parts));
}

/// Image turns are attached on the first few iterations and periodically
/// after that; skipped iterations do not grow the transcript at all.
pub fn should_attach_images(iteration: usize, limits: &RunLimits) -> bool {
    if iteration <= limits.image_attach_initial {
        return true;
    }
    limits.image_attach_every > 0 && iteration % limits.image_attach_every == 0
}

/// Drop image parts beyond the `keep` most recent across the whole
/// transcript, oldest first. A message left with no content, or with nothing
/// but the screenshot caption, is removed entirely.
pub fn prune_transcript_images(transcript: &mut Vec<ChatMessage>, keep: usize) {
    let total: usize = transcript
        .iter()
        .filter_map(|m| m.content.as_ref())
        .map(|c| c.image_part_count())
        .sum();
    if total <= keep {
        return;
    }
    let mut to_remove = total - keep;

    for msg in transcript.iter_mut() {
        if to_remove == 0 {
            break;
        }
        let Some(MessageContent::Parts(parts)) = msg.content.as_mut() else {
            continue;
        };
        parts.retain(|p| {
            if to_remove > 0 && matches!(p, ContentPart::ImageUrl { .. }) {
                to_remove -= 1;
                false
            } else {
                true
            }
        });
    }

    transcript.retain(|msg| match &msg.content {
        Some(MessageContent::Parts(parts)) => {
            if parts.is_empty() {
                return !msg.tool_calls.is_empty();
            }
            // an injected screenshot turn whose images were all pruned is
            // just its caption; drop it too
            !(parts.len() == 1
                && matches!(&parts[0], ContentPart::Text { text } if text == SCREENSHOT_CAPTION))
        }
        _ => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn png_payload(len: usize) -> String {
        let mut s = String::from("iVBORw0KGgo");
        s.push_str(&"A".repeat(len.saturating_sub(s.len())));
        s
    }

    #[test]
    fn extracts_by_magic_prefix() {
        let raw = json!({"ok": true, "data": png_payload(64)});
        let (cleaned, image) = extract_image(raw);
        assert_eq!(cleaned["data"], IMAGE_PLACEHOLDER);
        assert_eq!(cleaned["ok"], true);
        let image = image.unwrap();
        assert!(image.url.starts_with("data:image/png;base64,iVBORw0KGgo"));
    }

    #[test]
    fn extracts_by_key_name() {
        let raw = json!({"screenshot": "Q".repeat(500), "title": "Login page"});
        let (cleaned, image) = extract_image(raw);
        assert_eq!(cleaned["screenshot"], IMAGE_PLACEHOLDER);
        assert_eq!(cleaned["title"], "Login page");
        assert!(image.is_some());
    }

    #[test]
    fn short_value_under_image_key_is_not_a_payload() {
        let raw = json!({"image": "none captured"});
        let (cleaned, image) = extract_image(raw.clone());
        assert_eq!(cleaned, raw);
        assert!(image.is_none());
    }

    #[test]
    fn prose_under_image_key_is_not_a_payload() {
        let prose = "The screenshot shows a login form with two fields. ".repeat(20);
        let raw = json!({"screenshot_description": prose});
        let (cleaned, image) = extract_image(raw.clone());
        assert_eq!(cleaned, raw);
        assert!(image.is_none());
    }

    #[test]
    fn extracts_oversized_unmarked_field() {
        let raw = json!({"blob": "x".repeat(BARE_PAYLOAD_THRESHOLD + 1)});
        let (cleaned, image) = extract_image(raw);
        assert_eq!(cleaned["blob"], IMAGE_PLACEHOLDER);
        assert!(image.is_some());
    }

    #[test]
    fn walks_nested_maps_and_arrays() {
        let raw = json!({
            "steps": [
                {"note": "clicked", "screenshot": png_payload(400)},
                {"note": "typed"}
            ]
        });
        let (cleaned, image) = extract_image(raw);
        assert_eq!(cleaned["steps"][0]["screenshot"], IMAGE_PLACEHOLDER);
        assert_eq!(cleaned["steps"][0]["note"], "clicked");
        assert_eq!(cleaned["steps"][1]["note"], "typed");
        assert!(image.is_some());
    }

    #[test]
    fn image_free_result_round_trips_unchanged() {
        let raw = json!({"ok": true, "rows": [1, 2, 3], "text": "short"});
        let (cleaned, image) = extract_image(raw.clone());
        assert_eq!(cleaned, raw);
        assert!(image.is_none());
    }

    #[test]
    fn cleaning_is_idempotent() {
        let raw = json!({"screenshot": png_payload(400)});
        let (once, first) = extract_image(raw);
        assert!(first.is_some());
        let (twice, second) = extract_image(once.clone());
        assert_eq!(once, twice);
        assert!(second.is_none());
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut history = ScreenshotHistory::new(2, 3);
        for i in 0..4 {
            history.push(ImageRef {
                url: format!("data:image/png;base64,frame{i}"),
            });
        }
        assert_eq!(history.len(), 2);
        let urls: Vec<_> = history.iter().map(|i| i.url.clone()).collect();
        assert!(urls[0].ends_with("frame2"));
        assert!(urls[1].ends_with("frame3"));
    }

    #[test]
    fn duplicate_run_counts_and_trips_at_threshold() {
        let mut history = ScreenshotHistory::new(5, 3);
        let frame = ImageRef {
            url: "data:image/png;base64,same".into(),
        };
        assert!(!history.push(frame.clone()));
        assert_eq!(history.duplicate_run(), 1);
        assert!(!history.push(frame.clone()));
        assert_eq!(history.duplicate_run(), 2);
        assert!(history.push(frame.clone()));
        assert_eq!(history.duplicate_run(), 3);
        // a changed frame resets the run
        assert!(!history.push(ImageRef {
            url: "data:image/png;base64,other".into(),
        }));
        assert_eq!(history.duplicate_run(), 1);
    }

    #[test]
    fn inject_appends_single_user_turn_with_history() {
        let mut history = ScreenshotHistory::new(5, 3);
        history.push(ImageRef {
            url: "data:image/png;base64,a".into(),
        });
        history.push(ImageRef {
            url: "data:image/png;base64,b".into(),
        });
        let mut transcript = vec![ChatMessage::user("go")];
        inject_collected_images(&mut transcript, &history);
        assert_eq!(transcript.len(), 2);
        let msg = transcript.last().unwrap();
        assert_eq!(msg.role, "user");
        let content = msg.content.as_ref().unwrap();
        assert_eq!(content.image_part_count(), 2);
    }

    #[test]
    fn inject_skips_empty_history() {
        let history = ScreenshotHistory::new(5, 3);
        let mut transcript = vec![ChatMessage::user("go")];
        inject_collected_images(&mut transcript, &history);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn attach_cadence() {
        let limits = RunLimits::default(); // initial 3, every 3rd
        assert!(should_attach_images(1, &limits));
        assert!(should_attach_images(2, &limits));
        assert!(should_attach_images(3, &limits));
        assert!(!should_attach_images(4, &limits));
        assert!(!should_attach_images(5, &limits));
        assert!(should_attach_images(6, &limits));
        assert!(should_attach_images(9, &limits));
    }

    fn image_turn(urls: &[&str]) -> ChatMessage {
        let mut parts = vec![ContentPart::Text {
            text: SCREENSHOT_CAPTION.to_string(),
        }];
        for url in urls {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrlPart {
                    url: (*url).to_string(),
                },
            });
        }
        ChatMessage::user_parts(parts)
    }

    fn transcript_image_count(transcript: &[ChatMessage]) -> usize {
        transcript
            .iter()
            .filter_map(|m| m.content.as_ref())
            .map(|c| c.image_part_count())
            .sum()
    }

    #[test]
    fn prune_keeps_most_recent_images() {
        let mut transcript = vec![
            ChatMessage::user("start"),
            image_turn(&["a", "b"]),
            image_turn(&["c", "d"]),
            image_turn(&["e", "f"]),
        ];
        prune_transcript_images(&mut transcript, 3);
        assert_eq!(transcript_image_count(&transcript), 3);
        // the oldest turn lost both images and was removed with its caption
        assert_eq!(transcript.len(), 3);
        assert_eq!(
            transcript[0].content.as_ref().unwrap().as_text(),
            Some("start")
        );
    }

    #[test]
    fn prune_is_noop_under_limit() {
        let mut transcript = vec![ChatMessage::user("start"), image_turn(&["a", "b"])];
        prune_transcript_images(&mut transcript, 5);
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript_image_count(&transcript), 2);
    }

    #[test]
    fn prune_preserves_text_parts_of_mixed_messages() {
        let mut transcript = vec![
            ChatMessage::user_parts(vec![
                ContentPart::Text {
                    text: "context".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrlPart { url: "old".into() },
                },
            ]),
            image_turn(&["new"]),
        ];
        prune_transcript_images(&mut transcript, 1);
        assert_eq!(transcript.len(), 2);
        let first = transcript[0].content.as_ref().unwrap();
        assert_eq!(first.image_part_count(), 0);
        match first {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(&parts[0], ContentPart::Text { text } if text == "context"));
            }
            _ => panic!("expected parts"),
        }
    }
}
