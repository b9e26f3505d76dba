//! Voice command recognition.
//!
//! Pure, synchronous matching over STT transcripts: wake-word admission,
//! the global command grammar, and the per-menu choice matchers. All
//! matching is case-insensitive, tolerant of trailing punctuation, and
//! includes explicit aliases for common STT misrecognitions ("weight" for
//! "wait", "cue" for "queue").
//!
//! # Supported commands (after the wake word)
//!
//! | Phrase pattern | Command |
//! |----------------|---------|
//! | "wait mode" / "inbox mode" / "ask mode" | `Mode` |
//! | "switch to {channel}" | `Switch` |
//! | "list channels" | `List` |
//! | "go back" / "default" / "done" | `Default` |
//! | "dispatch {body}" | `Dispatch` |
//! | "noise {low\|medium\|high}" | `Noise` |
//! | "delay {n} seconds" | `Delay` |
//! | "longer/shorter delay" | `DelayAdjust` |
//! | "settings" | `Settings` |
//! | "new post" | `NewPost` |
//! | "inbox" | `InboxCheck` |
//! | "next" | `InboxNext` |
//! | "clear inbox" | `InboxClear` |
//! | "read the last message" | `ReadLastMessage` |
//! | "status" | `VoiceStatus` |
//! | "pause" / "stop" | `Pause` |
//! | "say that again" | `Replay` |
//! | "gated mode on/off" | `GatedMode` |
//! | "earcon tour" | `EarconTour` |
//! | "silent wait" | `SilentWait` |
//! | (nothing) | `WakeCheck` |

use crate::config::NoiseLevel;
use crate::queue::QueueMode;

/// A recognized voice command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCommand {
    /// Bare wake word: open a prompt grace window.
    WakeCheck,
    /// Switch the active channel.
    Switch {
        /// Spoken channel name or raw channel id.
        channel: String,
    },
    /// Enumerate configured channels.
    List,
    /// Return to the default channel.
    Default,
    /// Adjust the noise gate.
    Noise {
        /// Requested sensitivity band.
        level: NoiseLevel,
    },
    /// Set the end-of-utterance delay.
    Delay {
        /// New delay in milliseconds.
        value_ms: u64,
    },
    /// Nudge the end-of-utterance delay.
    DelayAdjust {
        /// `true` = longer, `false` = shorter.
        longer: bool,
    },
    /// Speak the adjustable-settings help.
    Settings,
    /// Start the guided forum-post flow.
    NewPost,
    /// Change the queue/voice mode.
    Mode {
        /// Requested mode.
        mode: QueueMode,
    },
    /// Check all channels for new activity.
    InboxCheck,
    /// Advance the inbox iteration.
    InboxNext,
    /// Mark all remaining inbox items seen.
    InboxClear,
    /// Read the most recent message in the active channel.
    ReadLastMessage,
    /// Speak a settings summary.
    VoiceStatus,
    /// Stop current playback.
    Pause,
    /// Repeat the last spoken response.
    Replay,
    /// Toggle gated (wake-word-required) mode.
    GatedMode {
        /// New gated state.
        on: bool,
    },
    /// Play every earcon in sequence.
    EarconTour,
    /// Suppress the waiting tone for the next wait.
    SilentWait,
    /// Queue a prompt onto another channel without switching.
    Dispatch {
        /// Raw body after the dispatch keyword ("{channel} {payload}").
        body: String,
    },
}

/// Outcome of the queue-choice menu matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueChoice {
    /// Leave the response in the inbox.
    Queue,
    /// Hold on the line for the response.
    Wait,
    /// Wait without the waiting tone.
    Silent,
    /// Abandon the prompt.
    Cancel,
}

/// Outcome of the switch-choice menu matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchChoice {
    /// Read the channel's most recent message.
    Read,
    /// Treat the next utterance as a fresh prompt.
    Prompt,
    /// Dismiss the menu.
    Cancel,
}

/// Lowercase, trim, and strip trailing sentence punctuation.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', ',', '!', '?', ';', ':'])
        .to_lowercase()
}

/// Returns `true` when `text` is empty or a non-lexical STT artifact such as
/// `[BLANK_AUDIO]`, `[SOUND]`, or `(coughing)`.
#[must_use]
pub fn is_non_lexical(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    // All tokens are bracketed tags → non-lexical.
    trimmed.split_whitespace().all(|tok| {
        (tok.starts_with('[') && tok.ends_with(']'))
            || (tok.starts_with('(') && tok.ends_with(')'))
    })
}

/// Strip an optional `hey`/`hello` greeting token.
fn strip_greeting(text: &str) -> &str {
    for greeting in ["hey", "hello"] {
        if let Some(rest) = text.strip_prefix(greeting) {
            // Require a token boundary so "heyday watson" is not a greeting.
            if rest.starts_with([',', ' ']) {
                return rest.trim_start_matches(',').trim_start();
            }
        }
    }
    text
}

/// Returns `true` when `text` begins with the wake word.
///
/// Accepts an optional `hey`/`hello` greeting and trailing punctuation on the
/// name itself. The name must be a whole token: it never matches as a
/// substring inside another word.
#[must_use]
pub fn matches_wake_word(text: &str, bot_name: &str) -> bool {
    wake_tail(text, bot_name).is_some()
}

/// Strip the wake prefix, returning the remaining command tail.
///
/// Returns `None` when `text` does not start with the wake word.
#[must_use]
pub fn wake_tail(text: &str, bot_name: &str) -> Option<String> {
    let lowered = text.trim().to_lowercase();
    let bot = bot_name.trim().to_lowercase();
    if bot.is_empty() {
        return None;
    }

    let body = strip_greeting(&lowered);
    let rest = body.strip_prefix(&bot)?;

    // Whole-token boundary: the name may carry one trailing punctuation mark
    // and must then end or be followed by whitespace.
    let rest = rest.strip_prefix([',', '.', '?', '!']).unwrap_or(rest);
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().to_owned())
}

/// Levenshtein distance, capped at 2 for early exit.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Returns `true` when the transcript *almost* starts with the wake word:
/// one of the leading two tokens is within edit distance 1 of the bot name.
///
/// Callers invoke this only after [`matches_wake_word`] has failed, so an
/// exact name off its leading position ("or Watson, inbox") also counts as a
/// missed wake attempt.
#[must_use]
pub fn near_miss_wake(text: &str, bot_name: &str) -> bool {
    let bot = bot_name.trim().to_lowercase();
    if bot.len() < 3 {
        return false;
    }
    let lowered = text.trim().to_lowercase();
    for token in lowered.split_whitespace().take(2) {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if !token.is_empty() && edit_distance(token, &bot) <= 1 {
            return true;
        }
    }
    false
}

/// Parse a transcript as a wake-prefixed voice command.
///
/// Returns `None` when the wake word is absent or the tail matches no
/// pattern. The matcher list is ordered; earlier patterns win.
///
/// # Examples
///
/// ```
/// use watson::commands::{parse_voice_command, VoiceCommand};
///
/// let cmd = parse_voice_command("Watson, switch to research", "Watson");
/// assert_eq!(cmd, Some(VoiceCommand::Switch { channel: "research".into() }));
///
/// assert_eq!(parse_voice_command("what time is it", "Watson"), None);
/// ```
#[must_use]
pub fn parse_voice_command(text: &str, bot_name: &str) -> Option<VoiceCommand> {
    let tail = wake_tail(text, bot_name)?;
    let tail = normalize(&tail);

    if tail.is_empty() {
        return Some(VoiceCommand::WakeCheck);
    }

    // --- Mode switch (before switch-to: "switch to wait mode" is a mode) ---
    if let Some(mode) = match_mode_phrase(&tail) {
        return Some(VoiceCommand::Mode { mode });
    }

    // --- Switch to channel ---
    if let Some(channel) = extract_switch_target(&tail) {
        return Some(VoiceCommand::Switch { channel });
    }

    // --- List channels ---
    if matches_any(
        &tail,
        &["list channels", "list the channels", "what channels", "channels", "list"],
    ) {
        return Some(VoiceCommand::List);
    }

    // --- Default channel / go back ---
    if matches_any(&tail, &["default", "go back", "back", "home", "done", "main channel"]) {
        return Some(VoiceCommand::Default);
    }

    // --- Dispatch ---
    for prefix in ["dispatch to ", "dispatch ", "send to "] {
        if let Some(body) = tail.strip_prefix(prefix) {
            return Some(VoiceCommand::Dispatch {
                body: body.trim().to_owned(),
            });
        }
    }

    // --- Noise gate ---
    if let Some(level) = match_noise_phrase(&tail) {
        return Some(VoiceCommand::Noise { level });
    }

    // --- Delay value ---
    if let Some(value_ms) = match_delay_phrase(&tail) {
        return Some(VoiceCommand::Delay { value_ms });
    }

    // --- Delay nudge ---
    if matches_any(&tail, &["longer delay", "delay longer", "wait longer", "more delay"]) {
        return Some(VoiceCommand::DelayAdjust { longer: true });
    }
    if matches_any(
        &tail,
        &["shorter delay", "delay shorter", "wait less", "less delay", "quicker delay"],
    ) {
        return Some(VoiceCommand::DelayAdjust { longer: false });
    }

    // --- Settings help ---
    if matches_any(&tail, &["settings", "voice settings"]) {
        return Some(VoiceCommand::Settings);
    }

    // --- New forum post ---
    if matches_any(&tail, &["new post", "create a post", "make a post", "start a post"]) {
        return Some(VoiceCommand::NewPost);
    }

    // --- Inbox check ---
    if matches_any(
        &tail,
        &["inbox", "check inbox", "check the inbox", "check my inbox", "anything new", "what's new"],
    ) {
        return Some(VoiceCommand::InboxCheck);
    }

    // --- Inbox next ---
    if matches_any(&tail, &["next", "next one", "next item", "skip"]) {
        return Some(VoiceCommand::InboxNext);
    }

    // --- Inbox clear ---
    if matches_any(
        &tail,
        &["clear inbox", "clear the inbox", "mark all read", "dismiss all"],
    ) {
        return Some(VoiceCommand::InboxClear);
    }

    // --- Read last message ---
    if matches_any(
        &tail,
        &[
            "read the last message",
            "read last message",
            "read the latest message",
            "what did it say",
            "what was the last message",
        ],
    ) {
        return Some(VoiceCommand::ReadLastMessage);
    }

    // --- Voice status ---
    if matches_any(&tail, &["status", "voice status", "how are you set up"]) {
        return Some(VoiceCommand::VoiceStatus);
    }

    // --- Pause playback ---
    if matches_any(&tail, &["pause", "stop", "stop talking", "quiet", "shush", "be quiet"]) {
        return Some(VoiceCommand::Pause);
    }

    // --- Replay ---
    if matches_any(
        &tail,
        &["replay", "say that again", "repeat that", "what did you say", "again"],
    ) {
        return Some(VoiceCommand::Replay);
    }

    // --- Gated mode ---
    if matches_any(
        &tail,
        &["gated mode on", "gate on", "require the wake word", "closed mode"],
    ) {
        return Some(VoiceCommand::GatedMode { on: true });
    }
    if matches_any(
        &tail,
        &["gated mode off", "gate off", "open mode", "stop requiring the wake word"],
    ) {
        return Some(VoiceCommand::GatedMode { on: false });
    }

    // --- Earcon tour ---
    if matches_any(&tail, &["earcon tour", "sound tour", "play the sounds", "play your sounds"]) {
        return Some(VoiceCommand::EarconTour);
    }

    // --- Silent wait ---
    if matches_any(&tail, &["silent wait", "wait silently", "quiet wait", "silent mode wait"]) {
        return Some(VoiceCommand::SilentWait);
    }

    None
}

/// Return `true` if `text` equals any of the given `patterns`.
fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text == *p)
}

/// Match a queue/inbox/ask mode change phrase.
fn match_mode_phrase(text: &str) -> Option<QueueMode> {
    let t = text
        .strip_prefix("switch to ")
        .or_else(|| text.strip_prefix("change to "))
        .or_else(|| text.strip_prefix("go to "))
        .unwrap_or(text);
    let t = t.strip_prefix("the ").unwrap_or(t);

    match t {
        "wait mode" | "mode wait" => Some(QueueMode::Wait),
        "queue mode" | "inbox mode" | "mode queue" | "mode inbox" | "cue mode" => {
            Some(QueueMode::Queue)
        }
        "ask mode" | "mode ask" | "ask me mode" => Some(QueueMode::Ask),
        _ => None,
    }
}

/// Extract the target channel from a switch-style phrase.
fn extract_switch_target(text: &str) -> Option<String> {
    for prefix in ["switch to ", "change to ", "go to ", "switch channel to "] {
        if let Some(rest) = text.strip_prefix(prefix) {
            let rest = rest.strip_prefix("the ").unwrap_or(rest);
            let rest = rest.strip_suffix(" channel").unwrap_or(rest).trim();
            if rest.is_empty() {
                return None;
            }
            return Some(rest.to_owned());
        }
    }
    None
}

/// Match a noise-gate phrase.
fn match_noise_phrase(text: &str) -> Option<NoiseLevel> {
    let t = text
        .strip_prefix("set noise to ")
        .or_else(|| text.strip_prefix("set the noise to "))
        .or_else(|| text.strip_prefix("noise "))?;
    match t.trim() {
        "low" | "quiet" => Some(NoiseLevel::Low),
        "medium" | "normal" => Some(NoiseLevel::Medium),
        "high" | "loud" => Some(NoiseLevel::High),
        _ => None,
    }
}

/// Match an explicit delay value ("delay five seconds", "set delay to 2").
fn match_delay_phrase(text: &str) -> Option<u64> {
    let tail = text
        .strip_prefix("set delay to ")
        .or_else(|| text.strip_prefix("set the delay to "))
        .or_else(|| text.strip_prefix("delay "))?;

    let first = tail.split_whitespace().next()?;
    let seconds = parse_small_number(first)?;
    // The segmenter delay is bounded to keep turn-taking responsive.
    Some((seconds.min(10)) * 1000)
}

/// Parse a small spoken or numeric count (0–10).
fn parse_small_number(token: &str) -> Option<u64> {
    if let Ok(n) = token.parse::<u64>() {
        return Some(n);
    }
    let n = match token {
        "zero" => 0,
        "one" => 1,
        "two" | "to" | "too" => 2,
        "three" => 3,
        "four" | "for" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        _ => return None,
    };
    Some(n)
}

/// Strip punctuation stuck to a token ("no," → "no").
fn clean_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
}

/// Match the queue-choice menu (queue / wait / silent / cancel).
///
/// Returns `None` when nothing matches, and also when both a "queue" token
/// and a "wait" token appear together (ambiguous).
#[must_use]
pub fn match_queue_choice(text: &str) -> Option<QueueChoice> {
    let t = normalize(text);
    let tokens: Vec<&str> = t.split_whitespace().map(clean_token).collect();

    let has_queue = tokens
        .iter()
        .any(|w| matches!(*w, "queue" | "cue" | "q" | "kew" | "que"));
    let has_wait = tokens
        .iter()
        .any(|w| matches!(*w, "wait" | "weight" | "wheat" | "waits"));

    if has_queue && has_wait {
        return None;
    }
    if t == "never mind" || t == "nevermind" || t == "forget it" {
        return Some(QueueChoice::Cancel);
    }
    if tokens.iter().any(|w| matches!(*w, "cancel" | "cancelled" | "abort")) {
        return Some(QueueChoice::Cancel);
    }
    if tokens
        .iter()
        .any(|w| matches!(*w, "silent" | "silently" | "quiet" | "quietly"))
    {
        return Some(QueueChoice::Silent);
    }
    if has_queue {
        return Some(QueueChoice::Queue);
    }
    if has_wait {
        return Some(QueueChoice::Wait);
    }
    None
}

/// Match the switch-choice menu (read / prompt / cancel).
#[must_use]
pub fn match_switch_choice(text: &str) -> Option<SwitchChoice> {
    let t = normalize(text);
    let tokens: Vec<&str> = t.split_whitespace().map(clean_token).collect();

    if t == "never mind" || t == "nevermind" || t == "forget it" {
        return Some(SwitchChoice::Cancel);
    }
    if tokens.iter().any(|w| matches!(*w, "cancel" | "cancelled" | "abort" | "no")) {
        return Some(SwitchChoice::Cancel);
    }
    if tokens
        .iter()
        .any(|w| matches!(*w, "read" | "red" | "reed" | "reading"))
    {
        return Some(SwitchChoice::Read);
    }
    if tokens
        .iter()
        .any(|w| matches!(*w, "prompt" | "prompted" | "ask" | "send" | "new"))
    {
        return Some(SwitchChoice::Prompt);
    }
    None
}

/// Match a channel-selection utterance against the offered options.
///
/// Tries, in order: a numeric pick (`"3"`, `"number 3"`), an exact
/// case-folded name match, then a substring fuzzy match either way.
#[must_use]
pub fn match_channel_selection(text: &str, options: &[String]) -> Option<usize> {
    let t = normalize(text);
    let t = t.strip_prefix("number ").unwrap_or(&t).trim();

    if !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()) {
        let n: usize = t.parse().ok()?;
        if n >= 1 && n <= options.len() {
            return Some(n - 1);
        }
        return None;
    }

    if let Some(idx) = options.iter().position(|o| o.to_lowercase() == t) {
        return Some(idx);
    }

    options.iter().position(|o| {
        let o = o.to_lowercase();
        o.contains(t) || t.contains(&o)
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const BOT: &str = "Watson";

    // -----------------------------------------------------------------------
    // Wake word
    // -----------------------------------------------------------------------

    #[test]
    fn wake_bare_name() {
        assert!(matches_wake_word("Watson", BOT));
        assert!(matches_wake_word("watson.", BOT));
        assert!(matches_wake_word("Watson, hello there", BOT));
    }

    #[test]
    fn wake_with_greeting() {
        assert!(matches_wake_word("hey Watson", BOT));
        assert!(matches_wake_word("Hello, Watson", BOT));
        assert!(matches_wake_word("hey, watson, inbox", BOT));
    }

    #[test]
    fn wake_not_substring() {
        assert!(!matches_wake_word("watsonian studies", BOT));
        assert!(!matches_wake_word("swatson", BOT));
    }

    #[test]
    fn wake_requires_leading_position() {
        assert!(!matches_wake_word("I told Watson already", BOT));
    }

    #[test]
    fn wake_tail_strips_prefix() {
        assert_eq!(wake_tail("Watson, inbox", BOT).unwrap(), "inbox");
        assert_eq!(wake_tail("hey watson switch to research", BOT).unwrap(), "switch to research");
        assert_eq!(wake_tail("Watson", BOT).unwrap(), "");
    }

    // -----------------------------------------------------------------------
    // Near-miss detection
    // -----------------------------------------------------------------------

    #[test]
    fn near_miss_one_edit() {
        assert!(near_miss_wake("watsen inbox please", BOT));
        assert!(near_miss_wake("whatson what's new", BOT));
    }

    #[test]
    fn near_miss_exact_name_off_position() {
        // Wake match fails on position; the stray exact name still counts.
        assert!(!matches_wake_word("or Watson inbox list", BOT));
        assert!(near_miss_wake("or watson inbox list", BOT));
    }

    #[test]
    fn near_miss_ignores_distant_words() {
        assert!(!near_miss_wake("what time is it", BOT));
        assert!(!near_miss_wake("wilson was here today maybe", BOT)); // distance 2
    }

    #[test]
    fn near_miss_only_leading_two_tokens() {
        assert!(!near_miss_wake("please can you tell watsen", BOT));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("watson", "watson"), 0);
        assert_eq!(edit_distance("watson", "watsen"), 1);
        assert_eq!(edit_distance("watson", "whatson"), 1);
        assert_eq!(edit_distance("watson", "wilson"), 2);
    }

    // -----------------------------------------------------------------------
    // parse_voice_command: table
    // -----------------------------------------------------------------------

    fn parse(text: &str) -> Option<VoiceCommand> {
        parse_voice_command(text, BOT)
    }

    #[test]
    fn bare_wake_is_wake_check() {
        assert_eq!(parse("Watson"), Some(VoiceCommand::WakeCheck));
        assert_eq!(parse("hey Watson."), Some(VoiceCommand::WakeCheck));
    }

    #[test]
    fn no_wake_no_command() {
        assert_eq!(parse("switch to research"), None);
        assert_eq!(parse("inbox"), None);
    }

    #[test]
    fn mode_beats_switch() {
        assert_eq!(
            parse("Watson, switch to wait mode"),
            Some(VoiceCommand::Mode { mode: QueueMode::Wait })
        );
        assert_eq!(
            parse("Watson, inbox mode"),
            Some(VoiceCommand::Mode { mode: QueueMode::Queue })
        );
        assert_eq!(
            parse("Watson ask mode"),
            Some(VoiceCommand::Mode { mode: QueueMode::Ask })
        );
    }

    #[test]
    fn switch_to_channel() {
        assert_eq!(
            parse("Watson, switch to research"),
            Some(VoiceCommand::Switch { channel: "research".into() })
        );
        assert_eq!(
            parse("Watson go to the planning channel"),
            Some(VoiceCommand::Switch { channel: "planning".into() })
        );
        assert_eq!(
            parse("Watson switch to 994821004"),
            Some(VoiceCommand::Switch { channel: "994821004".into() })
        );
    }

    #[test]
    fn list_channels() {
        assert_eq!(parse("Watson, list channels"), Some(VoiceCommand::List));
        assert_eq!(parse("Watson list"), Some(VoiceCommand::List));
    }

    #[test]
    fn default_and_done() {
        assert_eq!(parse("Watson, go back"), Some(VoiceCommand::Default));
        assert_eq!(parse("Watson default"), Some(VoiceCommand::Default));
        assert_eq!(parse("Watson, done"), Some(VoiceCommand::Default));
    }

    #[test]
    fn dispatch_keeps_body() {
        assert_eq!(
            parse("Watson, dispatch research what changed overnight"),
            Some(VoiceCommand::Dispatch { body: "research what changed overnight".into() })
        );
        assert_eq!(
            parse("Watson send to planning move the sync to friday"),
            Some(VoiceCommand::Dispatch { body: "planning move the sync to friday".into() })
        );
    }

    #[test]
    fn noise_levels() {
        assert_eq!(
            parse("Watson, noise low"),
            Some(VoiceCommand::Noise { level: NoiseLevel::Low })
        );
        assert_eq!(
            parse("Watson set noise to high"),
            Some(VoiceCommand::Noise { level: NoiseLevel::High })
        );
    }

    #[test]
    fn delay_values() {
        assert_eq!(parse("Watson, delay two"), Some(VoiceCommand::Delay { value_ms: 2000 }));
        assert_eq!(
            parse("Watson set delay to 3 seconds"),
            Some(VoiceCommand::Delay { value_ms: 3000 })
        );
        // Spoken value is capped.
        assert_eq!(parse("Watson delay 99"), Some(VoiceCommand::Delay { value_ms: 10_000 }));
    }

    #[test]
    fn delay_adjust() {
        assert_eq!(parse("Watson, longer delay"), Some(VoiceCommand::DelayAdjust { longer: true }));
        assert_eq!(
            parse("Watson shorter delay"),
            Some(VoiceCommand::DelayAdjust { longer: false })
        );
    }

    #[test]
    fn settings_and_status() {
        assert_eq!(parse("Watson, settings"), Some(VoiceCommand::Settings));
        assert_eq!(parse("Watson voice status"), Some(VoiceCommand::VoiceStatus));
        assert_eq!(parse("Watson status"), Some(VoiceCommand::VoiceStatus));
    }

    #[test]
    fn new_post() {
        assert_eq!(parse("Watson, new post"), Some(VoiceCommand::NewPost));
        assert_eq!(parse("Watson create a post"), Some(VoiceCommand::NewPost));
    }

    #[test]
    fn inbox_family() {
        assert_eq!(parse("Watson, inbox"), Some(VoiceCommand::InboxCheck));
        assert_eq!(parse("Watson anything new"), Some(VoiceCommand::InboxCheck));
        assert_eq!(parse("Watson, next"), Some(VoiceCommand::InboxNext));
        assert_eq!(parse("Watson clear inbox"), Some(VoiceCommand::InboxClear));
    }

    #[test]
    fn read_last_message() {
        assert_eq!(parse("Watson, read the last message"), Some(VoiceCommand::ReadLastMessage));
        assert_eq!(parse("Watson what did it say"), Some(VoiceCommand::ReadLastMessage));
    }

    #[test]
    fn pause_and_replay() {
        assert_eq!(parse("Watson, stop"), Some(VoiceCommand::Pause));
        assert_eq!(parse("Watson pause"), Some(VoiceCommand::Pause));
        assert_eq!(parse("Watson say that again"), Some(VoiceCommand::Replay));
    }

    #[test]
    fn gated_mode() {
        assert_eq!(parse("Watson, gated mode on"), Some(VoiceCommand::GatedMode { on: true }));
        assert_eq!(parse("Watson open mode"), Some(VoiceCommand::GatedMode { on: false }));
    }

    #[test]
    fn earcon_tour_and_silent_wait() {
        assert_eq!(parse("Watson, earcon tour"), Some(VoiceCommand::EarconTour));
        assert_eq!(parse("Watson silent wait"), Some(VoiceCommand::SilentWait));
    }

    #[test]
    fn free_prompt_is_not_a_command() {
        assert_eq!(parse("Watson, what time is it in tokyo"), None);
        assert_eq!(parse("Watson remind me to buy milk"), None);
    }

    #[test]
    fn unicode_and_long_inputs_no_crash() {
        assert_eq!(parse("ワトソン、切り替えて"), None);
        let long = format!("Watson {}", "a ".repeat(5000));
        assert_eq!(parse(&long), None);
    }

    // -----------------------------------------------------------------------
    // Queue choice
    // -----------------------------------------------------------------------

    #[test]
    fn queue_choice_canonical() {
        assert_eq!(match_queue_choice("queue"), Some(QueueChoice::Queue));
        assert_eq!(match_queue_choice("wait"), Some(QueueChoice::Wait));
        assert_eq!(match_queue_choice("silent"), Some(QueueChoice::Silent));
        assert_eq!(match_queue_choice("cancel"), Some(QueueChoice::Cancel));
    }

    #[test]
    fn queue_choice_stt_aliases() {
        assert_eq!(match_queue_choice("weight"), Some(QueueChoice::Wait));
        assert_eq!(match_queue_choice("wheat"), Some(QueueChoice::Wait));
        assert_eq!(match_queue_choice("cue"), Some(QueueChoice::Queue));
        assert_eq!(match_queue_choice("q"), Some(QueueChoice::Queue));
        assert_eq!(match_queue_choice("quietly please"), Some(QueueChoice::Silent));
        assert_eq!(match_queue_choice("never mind"), Some(QueueChoice::Cancel));
    }

    #[test]
    fn queue_choice_sentences() {
        assert_eq!(match_queue_choice("just queue it"), Some(QueueChoice::Queue));
        assert_eq!(match_queue_choice("I'll wait."), Some(QueueChoice::Wait));
    }

    #[test]
    fn queue_choice_ambiguous_is_none() {
        assert_eq!(match_queue_choice("queue or wait"), None);
        assert_eq!(match_queue_choice("wait no queue"), None);
    }

    #[test]
    fn queue_choice_unrelated_is_none() {
        assert_eq!(match_queue_choice("tell me a joke"), None);
        assert_eq!(match_queue_choice(""), None);
    }

    // -----------------------------------------------------------------------
    // Switch choice
    // -----------------------------------------------------------------------

    #[test]
    fn switch_choice_canonical() {
        assert_eq!(match_switch_choice("read"), Some(SwitchChoice::Read));
        assert_eq!(match_switch_choice("prompt"), Some(SwitchChoice::Prompt));
        assert_eq!(match_switch_choice("cancel"), Some(SwitchChoice::Cancel));
    }

    #[test]
    fn switch_choice_aliases() {
        assert_eq!(match_switch_choice("red"), Some(SwitchChoice::Read));
        assert_eq!(match_switch_choice("reed it please"), Some(SwitchChoice::Read));
        assert_eq!(match_switch_choice("prompted"), Some(SwitchChoice::Prompt));
        assert_eq!(match_switch_choice("no, forget it"), Some(SwitchChoice::Cancel));
    }

    #[test]
    fn switch_choice_cancel_beats_read() {
        // "no" is a cancel token even when other words follow.
        assert_eq!(match_switch_choice("no don't read it"), Some(SwitchChoice::Cancel));
    }

    #[test]
    fn switch_choice_unrelated_is_none() {
        assert_eq!(match_switch_choice("banana"), None);
    }

    // -----------------------------------------------------------------------
    // Channel selection
    // -----------------------------------------------------------------------

    fn options() -> Vec<String> {
        vec!["general".to_owned(), "research".to_owned(), "release planning".to_owned()]
    }

    #[test]
    fn selection_numeric() {
        assert_eq!(match_channel_selection("2", &options()), Some(1));
        assert_eq!(match_channel_selection("number 3", &options()), Some(2));
        assert_eq!(match_channel_selection("0", &options()), None);
        assert_eq!(match_channel_selection("9", &options()), None);
    }

    #[test]
    fn selection_exact_name() {
        assert_eq!(match_channel_selection("research", &options()), Some(1));
        assert_eq!(match_channel_selection("Research.", &options()), Some(1));
    }

    #[test]
    fn selection_substring() {
        assert_eq!(match_channel_selection("planning", &options()), Some(2));
        assert_eq!(match_channel_selection("the release planning one", &options()), Some(2));
    }

    #[test]
    fn selection_idempotent_on_canonical_names() {
        let opts = options();
        for (i, name) in opts.iter().enumerate() {
            let first = match_channel_selection(name, &opts).unwrap();
            assert_eq!(first, i);
            let again = match_channel_selection(&opts[first], &opts).unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn selection_no_match() {
        assert_eq!(match_channel_selection("the moon", &options()), None);
    }

    // -----------------------------------------------------------------------
    // Non-lexical filter
    // -----------------------------------------------------------------------

    #[test]
    fn non_lexical_tags() {
        assert!(is_non_lexical(""));
        assert!(is_non_lexical("   "));
        assert!(is_non_lexical("[BLANK_AUDIO]"));
        assert!(is_non_lexical("[SOUND]"));
        assert!(is_non_lexical("(coughing)"));
        assert!(is_non_lexical("[MUSIC] [NOISE]"));
    }

    #[test]
    fn lexical_text_passes() {
        assert!(!is_non_lexical("watson inbox"));
        assert!(!is_non_lexical("[SOUND] hello"));
    }
}
