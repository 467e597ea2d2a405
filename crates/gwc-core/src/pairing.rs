use crate::wire::PairingEvent;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

pub const MAX_LOG_TAIL: usize = 200;

pub const DEFAULT_DONE_SUCCESS_TOKENS: &[&str] = &[
    "success",
    "connected",
    "linked",
    "logged in",
    "authenticated",
    "paired",
];

/// Matched at the start of a word, so "errors" and "failed" count but
/// "terror" does not.
pub const DEFAULT_DONE_FAILURE_TOKENS: &[&str] = &[
    "fail", "error", "disconnect", "timeout", "timed out", "expired", "denied", "not ", "cannot",
    "unable",
];

/// Phrases that report the absence of a failure; removed before the failure
/// tokens are checked.
const DONE_CLEARED_PHRASES: &[&str] = &[
    "no errors",
    "no error",
    "without errors",
    "without error",
    "0 errors",
    "zero errors",
    "no failures",
    "without failure",
];

pub const DEFAULT_LOG_SUCCESS_TOKENS: &[&str] = &[
    "successfully authenticated",
    "authenticated successfully",
    "login successful",
    "logged in as",
    "pairing complete",
    "linked successfully",
    "connected successfully",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingPhase {
    Idle,
    Connecting,
    Scanning,
    Success,
    Error,
}

impl PairingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingPhase::Idle => "idle",
            PairingPhase::Connecting => "connecting",
            PairingPhase::Scanning => "scanning",
            PairingPhase::Success => "success",
            PairingPhase::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PairingPhase::Connecting | PairingPhase::Scanning)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingPhase::Success | PairingPhase::Error)
    }
}

impl fmt::Display for PairingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path reported success. Both the terminal event and the log scan
/// are honoured; the first one to fire latches the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuccessSource {
    DoneEvent,
    LogLine,
    ChannelConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingTransition {
    Ignored,
    Started,
    CodeRotated,
    Logged,
    Succeeded(SuccessSource),
    Failed,
}

impl PairingTransition {
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            PairingTransition::Succeeded(_) | PairingTransition::Failed
        )
    }
}

/// Case-insensitive substring matching for pairing outcomes.
#[derive(Debug, Clone)]
pub struct SuccessMatcher {
    done_success: Regex,
    done_failure: Regex,
    done_cleared: Regex,
    log_success: Regex,
}

impl SuccessMatcher {
    pub fn new(
        done_success: &[&str],
        done_failure: &[&str],
        log_success: &[&str],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            done_success: token_pattern(done_success)?,
            done_failure: word_start_pattern(done_failure)?,
            done_cleared: token_pattern(DONE_CLEARED_PHRASES)?,
            log_success: token_pattern(log_success)?,
        })
    }

    /// Failure tokens take precedence so "disconnected" never reads as
    /// "connected". "connected, no errors" is still a success.
    pub fn is_done_success(&self, text: &str) -> bool {
        let remaining = self.done_cleared.replace_all(text, " ");
        !self.done_failure.is_match(&remaining) && self.done_success.is_match(text)
    }

    pub fn is_log_success(&self, text: &str) -> bool {
        self.log_success.is_match(text)
    }
}

impl Default for SuccessMatcher {
    fn default() -> Self {
        Self::new(
            DEFAULT_DONE_SUCCESS_TOKENS,
            DEFAULT_DONE_FAILURE_TOKENS,
            DEFAULT_LOG_SUCCESS_TOKENS,
        )
        .expect("default pairing patterns compile")
    }
}

fn token_pattern(tokens: &[&str]) -> Result<Regex, regex::Error> {
    alternation_pattern(tokens, "")
}

fn word_start_pattern(tokens: &[&str]) -> Result<Regex, regex::Error> {
    alternation_pattern(tokens, r"\b")
}

fn alternation_pattern(tokens: &[&str], prefix: &str) -> Result<Regex, regex::Error> {
    if tokens.is_empty() {
        return Regex::new("[^\\s\\S]");
    }
    let alternation = tokens
        .iter()
        .map(|token| regex::escape(token))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i){prefix}(?:{alternation})"))
}

/// State of one pairing attempt for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingAttempt {
    pub channel_id: String,
    pub account: Option<String>,
    pub phase: PairingPhase,
    pub code: Option<String>,
    pub code_rotations: u32,
    pub log_tail: VecDeque<String>,
    pub error_message: Option<String>,
    pub success_source: Option<SuccessSource>,
    received_payload: bool,
}

impl PairingAttempt {
    pub fn new(channel_id: impl Into<String>, account: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            account,
            phase: PairingPhase::Idle,
            code: None,
            code_rotations: 0,
            log_tail: VecDeque::new(),
            error_message: None,
            success_source: None,
            received_payload: false,
        }
    }

    pub fn received_payload(&self) -> bool {
        self.received_payload
    }

    pub fn begin(&mut self) -> PairingTransition {
        if self.phase != PairingPhase::Idle {
            return PairingTransition::Ignored;
        }
        self.phase = PairingPhase::Connecting;
        PairingTransition::Started
    }

    pub fn apply(&mut self, event: &PairingEvent, matcher: &SuccessMatcher) -> PairingTransition {
        if !self.phase.is_active() {
            return PairingTransition::Ignored;
        }

        match event {
            PairingEvent::Ping { .. } => PairingTransition::Ignored,
            PairingEvent::Qr { data } => {
                self.received_payload = true;
                self.code = Some(data.clone());
                self.code_rotations += 1;
                self.phase = PairingPhase::Scanning;
                PairingTransition::CodeRotated
            }
            PairingEvent::Log { data } => {
                self.received_payload = true;
                self.push_log(data);
                if matcher.is_log_success(data) {
                    self.succeed(SuccessSource::LogLine)
                } else {
                    PairingTransition::Logged
                }
            }
            PairingEvent::Done { data } => {
                self.received_payload = true;
                let text = data.as_deref().unwrap_or("").trim();
                if !text.is_empty() {
                    self.push_log(text);
                }
                if matcher.is_done_success(text) {
                    self.succeed(SuccessSource::DoneEvent)
                } else if text.is_empty() {
                    self.fail("login process ended without confirming success")
                } else {
                    self.fail(text)
                }
            }
            PairingEvent::Error { data } => {
                self.received_payload = true;
                let message = data
                    .as_deref()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .unwrap_or("pairing failed");
                self.fail(message)
            }
        }
    }

    /// The push channel ended while the attempt was still waiting.
    pub fn transport_closed(&mut self) -> PairingTransition {
        if !self.phase.is_active() {
            return PairingTransition::Ignored;
        }
        if self.received_payload {
            self.fail("connection to the login process was lost")
        } else {
            self.fail("connection closed before the login process responded")
        }
    }

    /// One-shot latch: later success reports for the same attempt are ignored.
    pub fn succeed(&mut self, source: SuccessSource) -> PairingTransition {
        if !self.phase.is_active() {
            return PairingTransition::Ignored;
        }
        self.phase = PairingPhase::Success;
        self.success_source = Some(source);
        self.error_message = None;
        PairingTransition::Succeeded(source)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> PairingTransition {
        if !self.phase.is_active() {
            return PairingTransition::Ignored;
        }
        self.phase = PairingPhase::Error;
        self.code = None;
        self.error_message = Some(message.into());
        PairingTransition::Failed
    }

    /// Re-enters `connecting` from `error` with transient fields cleared.
    pub fn retry(&mut self, preserve_log: bool) -> PairingTransition {
        if self.phase != PairingPhase::Error {
            return PairingTransition::Ignored;
        }
        self.code = None;
        self.code_rotations = 0;
        self.error_message = None;
        self.success_source = None;
        self.received_payload = false;
        if !preserve_log {
            self.log_tail.clear();
        }
        self.phase = PairingPhase::Connecting;
        PairingTransition::Started
    }

    fn push_log(&mut self, line: &str) {
        if self.log_tail.len() == MAX_LOG_TAIL {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qr(code: &str) -> PairingEvent {
        PairingEvent::Qr {
            data: code.to_string(),
        }
    }

    fn log(text: &str) -> PairingEvent {
        PairingEvent::Log {
            data: text.to_string(),
        }
    }

    fn started(channel: &str) -> PairingAttempt {
        let mut attempt = PairingAttempt::new(channel, None);
        assert_eq!(attempt.begin(), PairingTransition::Started);
        attempt
    }

    #[test]
    fn rotating_codes_then_log_success_latches_once() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");

        let mut transitions = Vec::new();
        for event in [
            qr("CODE1"),
            qr("CODE2"),
            log("Successfully authenticated"),
            log("Successfully authenticated"),
            PairingEvent::Done {
                data: Some("success".to_string()),
            },
        ] {
            transitions.push(attempt.apply(&event, &matcher));
        }

        assert_eq!(attempt.code.as_deref(), Some("CODE2"));
        assert_eq!(attempt.phase, PairingPhase::Success);
        assert_eq!(attempt.success_source, Some(SuccessSource::LogLine));
        let successes = transitions
            .iter()
            .filter(|t| matches!(t, PairingTransition::Succeeded(_)))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(&transitions[3..], &[PairingTransition::Ignored; 2]);
    }

    #[test]
    fn first_code_moves_to_scanning() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");
        assert_eq!(attempt.phase, PairingPhase::Connecting);
        attempt.apply(&qr("A"), &matcher);
        assert_eq!(attempt.phase, PairingPhase::Scanning);
        assert_eq!(attempt.code_rotations, 1);
    }

    #[test]
    fn done_event_success_and_failure() {
        let matcher = SuccessMatcher::default();

        let mut ok = started("signal");
        let transition = ok.apply(
            &PairingEvent::Done {
                data: Some("Linked device".to_string()),
            },
            &matcher,
        );
        assert_eq!(
            transition,
            PairingTransition::Succeeded(SuccessSource::DoneEvent)
        );

        let mut failed = started("signal");
        failed.apply(&qr("X"), &matcher);
        let transition = failed.apply(
            &PairingEvent::Done {
                data: Some("QR code expired".to_string()),
            },
            &matcher,
        );
        assert_eq!(transition, PairingTransition::Failed);
        assert_eq!(failed.phase, PairingPhase::Error);
        assert_eq!(failed.error_message.as_deref(), Some("QR code expired"));
        assert_eq!(failed.code, None);

        let mut silent = started("signal");
        silent.apply(&PairingEvent::Done { data: None }, &matcher);
        assert_eq!(silent.phase, PairingPhase::Error);
    }

    #[test]
    fn disconnected_is_not_read_as_connected() {
        let matcher = SuccessMatcher::default();
        assert!(matcher.is_done_success("Connected"));
        assert!(!matcher.is_done_success("Disconnected"));
        assert!(!matcher.is_done_success("not connected"));
        assert!(matcher.is_log_success("[auth] SUCCESSFULLY AUTHENTICATED as +1555"));
        assert!(!matcher.is_log_success("waiting for scan"));
    }

    #[test]
    fn success_reporting_no_errors_is_still_success() {
        let matcher = SuccessMatcher::default();
        assert!(matcher.is_done_success("connected, no errors"));
        assert!(matcher.is_done_success("Linked without error"));
        assert!(!matcher.is_done_success("connected with errors"));
        assert!(!matcher.is_done_success("link failed after connected"));
        assert!(!matcher.is_done_success("cannot stay connected"));
    }

    #[test]
    fn explicit_error_event_fails_with_message() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");
        attempt.apply(
            &PairingEvent::Error {
                data: Some("  rate limited  ".to_string()),
            },
            &matcher,
        );
        assert_eq!(attempt.error_message.as_deref(), Some("rate limited"));

        let mut bare = started("whatsapp");
        bare.apply(&PairingEvent::Error { data: None }, &matcher);
        assert_eq!(bare.error_message.as_deref(), Some("pairing failed"));
    }

    #[test]
    fn transport_close_before_payload_is_error() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");
        attempt.apply(&PairingEvent::Ping { data: None }, &matcher);
        assert!(!attempt.received_payload());
        assert_eq!(attempt.transport_closed(), PairingTransition::Failed);
        assert_eq!(
            attempt.error_message.as_deref(),
            Some("connection closed before the login process responded")
        );

        let mut after_success = started("whatsapp");
        after_success.succeed(SuccessSource::DoneEvent);
        assert_eq!(after_success.transport_closed(), PairingTransition::Ignored);
        assert_eq!(after_success.phase, PairingPhase::Success);
    }

    #[test]
    fn retry_clears_transient_fields_and_optionally_keeps_log() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");
        attempt.apply(&qr("OLD"), &matcher);
        attempt.apply(&log("waiting"), &matcher);
        attempt.apply(&PairingEvent::Error { data: None }, &matcher);

        let mut kept = attempt.clone();
        assert_eq!(kept.retry(true), PairingTransition::Started);
        assert_eq!(kept.phase, PairingPhase::Connecting);
        assert_eq!(kept.code, None);
        assert_eq!(kept.error_message, None);
        assert_eq!(kept.code_rotations, 0);
        assert!(!kept.received_payload());
        assert_eq!(kept.log_tail.len(), 1);

        assert_eq!(attempt.retry(false), PairingTransition::Started);
        assert!(attempt.log_tail.is_empty());
    }

    #[test]
    fn retry_outside_error_is_ignored() {
        let mut attempt = started("whatsapp");
        assert_eq!(attempt.retry(false), PairingTransition::Ignored);
        assert_eq!(attempt.phase, PairingPhase::Connecting);
    }

    #[test]
    fn idle_attempt_ignores_events() {
        let matcher = SuccessMatcher::default();
        let mut attempt = PairingAttempt::new("whatsapp", None);
        assert_eq!(attempt.apply(&qr("A"), &matcher), PairingTransition::Ignored);
        assert_eq!(attempt.code, None);
    }

    #[test]
    fn log_tail_is_bounded() {
        let matcher = SuccessMatcher::default();
        let mut attempt = started("whatsapp");
        for i in 0..MAX_LOG_TAIL + 10 {
            attempt.apply(&log(&format!("line {i}")), &matcher);
        }
        assert_eq!(attempt.log_tail.len(), MAX_LOG_TAIL);
        assert_eq!(attempt.log_tail.front().map(String::as_str), Some("line 10"));
    }
}
