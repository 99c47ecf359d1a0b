//! Console line classification
//!
//! Pure helpers over a single line of server output:
//! - bracketed log tag extraction (`[12:00:00] [Server thread/INFO]: ...`)
//! - player join / leave / advancement detection
//! - IPv4 redaction before a line reaches the console history
//!
//! Nothing here fails: a line that does not match simply yields `None`
//! (or is returned unchanged).

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Tag written by the vanilla/Spigot/Forge main thread at INFO level.
pub const MAIN_THREAD_TAG: &str = "Server thread/INFO";

/// Marker printed once the server has finished loading the world.
pub const DONE_MARKER: &str = "Done";

/// Replacement for every redacted address.
pub const IP_MASK: &str = "***.***.***.***";

const IPV4_PATTERN: &str = r"\b(?:\d{1,3}\.){3}\d{1,3}\b";
const JOIN_PATTERN: &str = r"^(\S+) (?:\(formerly known as \S+\) )?joined the game";
const LEAVE_PATTERN: &str = r"^(\S+) left the game";
const ACHIEVEMENT_PATTERN: &str =
    r"^(\S+) has (?:made the advancement|reached the goal|completed the challenge) \[(.+)\]";

static IPV4_RE: OnceLock<Option<Regex>> = OnceLock::new();
static JOIN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static LEAVE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ACHIEVEMENT_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid console pattern '{}': {}", pattern, e);
            None
        }
    })
    .as_ref()
}

// ─── Tags ────────────────────────────────────────────────────

/// Collect the leading `[...]` tags of a line, in order.
///
/// Scanning stops at the first character outside a tag that is neither a
/// bracket nor a space, so `"[A] [B] text [C]"` yields `["A", "B"]`.
pub fn extract_tags(line: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut current = String::new();
    let mut in_tag = false;

    for c in line.chars() {
        match c {
            '[' => in_tag = true,
            ']' => {
                in_tag = false;
                tags.push(std::mem::take(&mut current));
            }
            _ if in_tag => current.push(c),
            ' ' => {}
            _ => break,
        }
    }
    tags
}

/// Byte offset just past the last leading tag, or `None` if the line does
/// not start with a tag.
fn end_of_tags(line: &str) -> Option<usize> {
    let mut in_tag = false;
    let mut end = None;

    for (i, c) in line.char_indices() {
        match c {
            '[' => in_tag = true,
            ']' if in_tag => {
                in_tag = false;
                end = Some(i + 1);
            }
            _ if in_tag => {}
            ' ' => {}
            _ => break,
        }
    }
    end
}

/// Text following the leading tags and their `": "` separator.
///
/// `"[12:00:00] [Server thread/INFO]: Steve joined the game"` becomes
/// `"Steve joined the game"`. A line without leading tags, or without a
/// `:` after them, is returned unchanged.
pub fn text_after_tags(line: &str) -> &str {
    let Some(end) = end_of_tags(line) else {
        return line;
    };
    let rest = &line[end..];
    match rest.find(':') {
        Some(colon) => {
            let after = &rest[colon + 1..];
            after.strip_prefix(' ').unwrap_or(after)
        }
        None => line,
    }
}

// ─── Player events ───────────────────────────────────────────

/// Name of the player in a `"<name> joined the game"` line.
pub fn did_player_join(text: &str) -> Option<String> {
    first_capture(cached(&JOIN_RE, JOIN_PATTERN)?.captures(text)?)
}

/// Name of the player in a `"<name> left the game"` line.
pub fn did_player_leave(text: &str) -> Option<String> {
    first_capture(cached(&LEAVE_RE, LEAVE_PATTERN)?.captures(text)?)
}

/// `(player, advancement)` for advancement, goal and challenge lines.
pub fn did_player_achievement(text: &str) -> Option<(String, String)> {
    let caps = cached(&ACHIEVEMENT_RE, ACHIEVEMENT_PATTERN)?.captures(text)?;
    let player = caps.get(1)?.as_str().to_string();
    let achievement = caps.get(2)?.as_str().to_string();
    Some((player, achievement))
}

fn first_capture(caps: Captures<'_>) -> Option<String> {
    caps.get(1).map(|m| m.as_str().to_string())
}

// ─── Redaction ───────────────────────────────────────────────

/// Replace every dotted quad whose octets are all within 0..=255 with
/// [`IP_MASK`]. Quads with an out-of-range octet are kept as-is.
pub fn redact_ipv4(line: &str) -> String {
    let Some(re) = cached(&IPV4_RE, IPV4_PATTERN) else {
        return line.to_string();
    };
    re.replace_all(line, |caps: &Captures<'_>| {
        let quad = &caps[0];
        if is_valid_quad(quad) {
            IP_MASK.to_string()
        } else {
            quad.to_string()
        }
    })
    .into_owned()
}

fn is_valid_quad(quad: &str) -> bool {
    quad.split('.')
        .all(|part| part.parse::<u16>().map(|n| n <= 255).unwrap_or(false))
}

// ─── Classification ──────────────────────────────────────────

/// What a single console line means for the server's state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineInfo {
    /// Line carries the main-thread tag and the completion marker.
    pub done: bool,
    pub joined: Option<String>,
    pub left: Option<String>,
    pub achievement: Option<(String, String)>,
}

/// Classify a raw (unredacted) console line.
///
/// Player events are only recognised on main-thread INFO lines so that
/// chat or plugin output cannot spoof them.
pub fn classify(line: &str) -> LineInfo {
    let tags = extract_tags(line);
    if !tags.iter().any(|t| t == MAIN_THREAD_TAG) {
        return LineInfo::default();
    }

    let text = text_after_tags(line);
    LineInfo {
        done: line.contains(DONE_MARKER),
        joined: did_player_join(text),
        left: did_player_leave(text),
        achievement: did_player_achievement(text),
    }
}
