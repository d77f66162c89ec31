//! Business outcome of a call, inferred from the coarse technical signals the platform reports.
//!
//! The classification is an ordered rule table: the first rule that returns an outcome wins.
//! Every rule only reads the stored record, so an outcome can always be re-derived without
//! contacting the platform.

use crate::db_types::{CallRecord, CallStatus, Outcome, OutcomeStatus, Role};

use rust_decimal::Decimal;

/// Phrases that betray an answering machine greeting in an assistant-only transcript.
pub const VOICEMAIL_INDICATORS: &[&str] = &[
    "voicemail",
    "voice mail",
    "leave a message",
    "after the beep",
    "beep",
    "unavailable",
    "cannot take your call",
    "please record",
    "mailbox",
    "greeting",
    "automated message",
];

pub const BRIEF_CALL_SECS: u32 = 30;
pub const VOICEMAIL_MAX_SECS: u32 = 60;
pub const IMMEDIATE_HANGUP_SECS: u32 = 5;
pub const QUICK_DECLINE_SECS: u32 = 15;
pub const SHORT_CALL_SECS: u32 = 45;
/// One cent.
pub const MIN_CONNECTED_COST: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Empirical cut-offs used by the duration and cost fallbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// Calls with user speech longer than this are fully answered.
    pub brief_call_secs: u32,
    /// Assistant-only calls shorter than this are voicemail.
    pub voicemail_max_secs: u32,
    pub immediate_hangup_secs: u32,
    pub quick_decline_secs: u32,
    pub short_call_secs: u32,
    pub min_connected_cost: Decimal,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            brief_call_secs: BRIEF_CALL_SECS,
            voicemail_max_secs: VOICEMAIL_MAX_SECS,
            immediate_hangup_secs: IMMEDIATE_HANGUP_SECS,
            quick_decline_secs: QUICK_DECLINE_SECS,
            short_call_secs: SHORT_CALL_SECS,
            min_connected_cost: MIN_CONNECTED_COST,
        }
    }
}

/// What the transcript tells us about who spoke.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranscriptSignals {
    pub has_user_speech: bool,
    pub assistant_only: bool,
    pub voicemail_phrase: bool,
}

/// Everything the rules look at, extracted once from the record.
#[derive(Clone, Debug)]
pub struct Signals<'a> {
    pub status: &'a CallStatus,
    /// Lowercased provider end reason, empty when absent.
    pub end_reason: String,
    pub raw_end_reason: Option<&'a str>,
    pub duration_secs: Option<f64>,
    /// Absent cost counts as zero.
    pub cost: Decimal,
    pub transcript: Option<TranscriptSignals>,
}

impl<'a> Signals<'a> {
    pub fn from_record(record: &'a CallRecord) -> Self {
        let duration_secs = match (record.started_at, record.ended_at) {
            (Some(started), Some(ended)) => Some((ended - started).as_seconds_f64()),
            _ => None,
        }
        // a negative span is unknown, same as the stored duration
        .filter(|secs| *secs >= 0.0);
        let transcript = (!record.transcript.is_empty()).then(|| {
            let spoken = record
                .transcript
                .iter()
                .filter(|entry| matches!(entry.role, Role::Assistant | Role::User));
            let mut has_user_speech = false;
            let mut any_spoken = false;
            let mut all_assistant = true;
            for entry in spoken {
                any_spoken = true;
                if entry.role == Role::User {
                    all_assistant = false;
                    has_user_speech |= !entry.message.trim().is_empty();
                }
            }
            let text = record
                .transcript_text
                .as_deref()
                .unwrap_or_default()
                .to_lowercase();
            TranscriptSignals {
                has_user_speech,
                assistant_only: any_spoken && all_assistant,
                voicemail_phrase: VOICEMAIL_INDICATORS
                    .iter()
                    .any(|indicator| text.contains(indicator)),
            }
        });

        Self {
            status: &record.status,
            end_reason: record
                .end_reason
                .as_deref()
                .unwrap_or_default()
                .to_lowercase(),
            raw_end_reason: record.end_reason.as_deref(),
            duration_secs,
            cost: record.cost.unwrap_or(Decimal::ZERO),
            transcript,
        }
    }

    fn reason_contains(&self, needles: &[&str]) -> bool {
        needles.iter().any(|needle| self.end_reason.contains(needle))
    }

    fn ended(&self) -> bool {
        *self.status == CallStatus::Ended
    }

    fn failed(&self) -> bool {
        *self.status == CallStatus::Failed
    }

    fn customer_hung_up(&self) -> bool {
        self.reason_contains(&["customer-ended-call"])
    }
}

pub type RuleFn = fn(&Signals, &Thresholds) -> Option<Outcome>;

pub struct Rule {
    pub name: &'static str,
    pub apply: RuleFn,
}

/// Precedence is the order of this table.
pub const RULES: &[Rule] = &[
    Rule { name: "failed-busy", apply: failed_busy },
    Rule { name: "failed-no-answer", apply: failed_no_answer },
    Rule { name: "failed-declined", apply: failed_declined },
    Rule { name: "failed-other", apply: failed_other },
    Rule { name: "ended-assistant-only", apply: ended_assistant_only },
    Rule { name: "ended-user-speech", apply: ended_user_speech },
    Rule { name: "ended-immediate-hangup", apply: ended_immediate_hangup },
    Rule { name: "ended-quick", apply: ended_quick },
    Rule { name: "ended-short", apply: ended_short },
    Rule { name: "ended-long", apply: ended_long },
    Rule { name: "ended-no-cost", apply: ended_no_cost },
    Rule { name: "ended-minimal-cost", apply: ended_minimal_cost },
    Rule { name: "ended-costed", apply: ended_costed },
    Rule { name: "pre-answer", apply: pre_answer },
    Rule { name: "in-progress", apply: in_progress },
];

fn failed_busy(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    (s.failed() && s.reason_contains(&["busy"]))
        .then(|| Outcome::new(OutcomeStatus::Busy, "Phone was busy"))
}

fn failed_no_answer(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    (s.failed() && s.reason_contains(&["no-answer", "timeout"]))
        .then(|| Outcome::new(OutcomeStatus::NoAnswer, "No answer - call timed out"))
}

fn failed_declined(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    (s.failed() && s.reason_contains(&["declined", "rejected"]))
        .then(|| Outcome::new(OutcomeStatus::Declined, "Call was declined"))
}

fn failed_other(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    s.failed().then(|| {
        Outcome::new(
            OutcomeStatus::Failed,
            format!(
                "Call failed - {}",
                s.raw_end_reason
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or("Unknown reason")
            ),
        )
    })
}

fn ended_assistant_only(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    let transcript = s.transcript.filter(|_| s.ended())?;
    if !transcript.assistant_only || transcript.has_user_speech {
        return None;
    }
    if s
        .duration_secs
        .is_some_and(|d| d < f64::from(t.voicemail_max_secs))
    {
        return Some(Outcome::new(
            OutcomeStatus::Voicemail,
            "Reached voicemail - message left by assistant",
        ));
    }
    transcript.voicemail_phrase.then(|| {
        Outcome::new(
            OutcomeStatus::Voicemail,
            "Reached voicemail - automated greeting detected",
        )
    })
}

fn ended_user_speech(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    let transcript = s.transcript.filter(|_| s.ended())?;
    if !transcript.has_user_speech {
        return None;
    }
    if s
        .duration_secs
        .is_some_and(|d| d > f64::from(t.brief_call_secs))
    {
        Some(Outcome::new(
            OutcomeStatus::Answered,
            "Call was answered - conversation recorded",
        ))
    } else {
        Some(Outcome::new(
            OutcomeStatus::AnsweredBrief,
            "Call answered but ended quickly",
        ))
    }
}

/// Duration of an ended call, if both timestamps are known.
fn ended_duration(s: &Signals) -> Option<f64> {
    s.duration_secs.filter(|_| s.ended())
}

fn ended_immediate_hangup(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    let duration = ended_duration(s)?;
    (duration < f64::from(t.immediate_hangup_secs)).then(|| {
        Outcome::new(
            OutcomeStatus::NoAnswer,
            "Call ended immediately - likely not answered",
        )
    })
}

fn ended_quick(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    let duration = ended_duration(s)?;
    if duration >= f64::from(t.quick_decline_secs) {
        return None;
    }
    if s.cost > Decimal::ZERO {
        Some(Outcome::new(OutcomeStatus::Declined, "Call was declined quickly"))
    } else {
        Some(Outcome::new(OutcomeStatus::NoAnswer, "Call not answered"))
    }
}

fn ended_short(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    let duration = ended_duration(s)?;
    if duration >= f64::from(t.short_call_secs) {
        return None;
    }
    if s.customer_hung_up() {
        Some(Outcome::new(
            OutcomeStatus::AnsweredBrief,
            "Call answered but customer hung up quickly",
        ))
    } else {
        Some(Outcome::new(OutcomeStatus::Voicemail, "Likely reached voicemail"))
    }
}

fn ended_long(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    ended_duration(s).map(|_| Outcome::new(OutcomeStatus::Answered, "Call was answered"))
}

/// Ended without computable duration.
fn ended_undated(s: &Signals) -> bool {
    s.ended() && s.duration_secs.is_none()
}

fn ended_no_cost(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    (ended_undated(s) && s.cost.is_zero()).then(|| {
        Outcome::new(
            OutcomeStatus::NoAnswer,
            "No cost incurred - call not connected",
        )
    })
}

fn ended_minimal_cost(s: &Signals, t: &Thresholds) -> Option<Outcome> {
    (ended_undated(s) && s.cost < t.min_connected_cost)
        .then(|| Outcome::new(OutcomeStatus::Declined, "Call declined - minimal cost"))
}

fn ended_costed(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    if !ended_undated(s) {
        return None;
    }
    if s.customer_hung_up() {
        Some(Outcome::new(OutcomeStatus::Answered, "Call completed by customer"))
    } else {
        Some(Outcome::new(OutcomeStatus::Voicemail, "Likely reached voicemail"))
    }
}

fn pre_answer(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    matches!(s.status, CallStatus::Queued | CallStatus::Ringing)
        .then(|| Outcome::new(OutcomeStatus::Ringing, "Call is ringing..."))
}

fn in_progress(s: &Signals, _: &Thresholds) -> Option<Outcome> {
    (*s.status == CallStatus::InProgress)
        .then(|| Outcome::new(OutcomeStatus::InProgress, "Call is active"))
}

#[derive(Clone, Debug, Default)]
pub struct Classifier {
    pub thresholds: Thresholds,
}

impl Classifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, record: &CallRecord) -> Outcome {
        let signals = Signals::from_record(record);
        RULES
            .iter()
            .find_map(|rule| (rule.apply)(&signals, &self.thresholds))
            .unwrap_or_else(|| {
                Outcome::new(
                    OutcomeStatus::Unknown,
                    format!("Unknown call status: {}", record.status),
                )
            })
    }

    /// Name of the rule that decides `record`, for audit logging.
    pub fn deciding_rule(&self, record: &CallRecord) -> Option<&'static str> {
        let signals = Signals::from_record(record);
        RULES
            .iter()
            .find(|rule| (rule.apply)(&signals, &self.thresholds).is_some())
            .map(|rule| rule.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_state::render_transcript;
    use crate::db_types::TranscriptEntry;
    use crate::test_support::call_record;
    use time::{macros::datetime, Duration};

    fn classify(record: &CallRecord) -> Outcome {
        Classifier::default().classify(record)
    }

    fn ended_after(secs: i64) -> CallRecord {
        let mut record = call_record("call-1");
        record.status = CallStatus::Ended;
        let start = datetime!(2024-05-01 10:00:00 UTC);
        record.started_at = Some(start);
        record.ended_at = Some(start + Duration::seconds(secs));
        record
    }

    fn with_transcript(mut record: CallRecord, turns: &[(Role, &str)]) -> CallRecord {
        record.transcript = turns
            .iter()
            .map(|(role, message)| TranscriptEntry {
                role: role.clone(),
                message: message.to_string(),
                timestamp: None,
            })
            .collect();
        record.transcript_text = render_transcript(&record.transcript);
        record
    }

    fn failed_with(reason: &str) -> CallRecord {
        let mut record = call_record("call-1");
        record.status = CallStatus::Failed;
        record.end_reason = Some(reason.to_string());
        record
    }

    #[test]
    fn scenario_a_timeout_failure_is_no_answer() {
        let outcome = classify(&failed_with("customer-did-not-answer-timeout"));
        assert_eq!(outcome.status, OutcomeStatus::NoAnswer);
    }

    #[test]
    fn scenario_b_user_speech_over_brief_threshold_is_answered() {
        let record = with_transcript(
            ended_after(40),
            &[
                (Role::Assistant, "hi"),
                (Role::User, "hello, I'm interested"),
            ],
        );
        assert_eq!(classify(&record).status, OutcomeStatus::Answered);
    }

    #[test]
    fn scenario_c_assistant_only_short_call_is_voicemail() {
        let record = with_transcript(
            ended_after(20),
            &[(Role::Assistant, "leave a message after the beep")],
        );
        let outcome = classify(&record);
        assert_eq!(outcome.status, OutcomeStatus::Voicemail);
        assert_eq!(
            outcome.description,
            "Reached voicemail - message left by assistant"
        );
    }

    #[test]
    fn failed_reasons_map_in_order() {
        assert_eq!(classify(&failed_with("customer-busy")).status, OutcomeStatus::Busy);
        assert_eq!(
            classify(&failed_with("Call-Rejected")).status,
            OutcomeStatus::Declined
        );
        let other = classify(&failed_with("twilio-failed-to-connect-call"));
        assert_eq!(other.status, OutcomeStatus::Failed);
        assert_eq!(other.description, "Call failed - twilio-failed-to-connect-call");
    }

    #[test]
    fn failed_without_reason_says_unknown_reason() {
        let mut record = call_record("call-1");
        record.status = CallStatus::Failed;
        assert_eq!(classify(&record).description, "Call failed - Unknown reason");
    }

    #[test]
    fn long_assistant_only_call_needs_voicemail_phrase() {
        let greeting = with_transcript(
            ended_after(90),
            &[(Role::Assistant, "The person you are calling is unavailable")],
        );
        assert_eq!(
            classify(&greeting).description,
            "Reached voicemail - automated greeting detected"
        );

        // no phrase: falls through to the duration heuristics
        let monologue = with_transcript(ended_after(90), &[(Role::Assistant, "Hello there")]);
        assert_eq!(classify(&monologue).status, OutcomeStatus::Answered);
        assert_eq!(
            Classifier::default().deciding_rule(&monologue),
            Some("ended-long")
        );
    }

    #[test]
    fn system_messages_do_not_break_assistant_only() {
        let record = with_transcript(
            ended_after(25),
            &[
                (Role::System, "You are an interviewer"),
                (Role::Assistant, "Hi, is this a good time?"),
            ],
        );
        assert_eq!(classify(&record).status, OutcomeStatus::Voicemail);
    }

    #[test]
    fn brief_user_speech_is_answered_brief() {
        let record = with_transcript(
            ended_after(12),
            &[(Role::Assistant, "hi"), (Role::User, "not now")],
        );
        assert_eq!(classify(&record).status, OutcomeStatus::AnsweredBrief);

        // no timestamps: still brief
        let mut undated = record.clone();
        undated.started_at = None;
        undated.ended_at = None;
        assert_eq!(classify(&undated).status, OutcomeStatus::AnsweredBrief);
    }

    #[test]
    fn duration_fallbacks_without_transcript() {
        assert_eq!(classify(&ended_after(3)).status, OutcomeStatus::NoAnswer);

        let mut quick = ended_after(10);
        assert_eq!(classify(&quick).status, OutcomeStatus::NoAnswer);
        quick.cost = Some(Decimal::new(3, 2));
        assert_eq!(classify(&quick).status, OutcomeStatus::Declined);

        let mut short = ended_after(30);
        assert_eq!(classify(&short).status, OutcomeStatus::Voicemail);
        short.end_reason = Some("customer-ended-call".to_string());
        assert_eq!(classify(&short).status, OutcomeStatus::AnsweredBrief);

        assert_eq!(classify(&ended_after(45)).status, OutcomeStatus::Answered);
    }

    #[test]
    fn cost_fallbacks_without_duration() {
        let mut record = call_record("call-1");
        record.status = CallStatus::Ended;
        assert_eq!(classify(&record).status, OutcomeStatus::NoAnswer);

        record.cost = Some(Decimal::new(5, 3));
        assert_eq!(classify(&record).status, OutcomeStatus::Declined);

        record.cost = Some(Decimal::new(25, 2));
        assert_eq!(classify(&record).status, OutcomeStatus::Voicemail);

        record.end_reason = Some("customer-ended-call".to_string());
        let outcome = classify(&record);
        assert_eq!(outcome.status, OutcomeStatus::Answered);
        assert_eq!(outcome.description, "Call completed by customer");
    }

    #[test]
    fn reversed_timestamps_fall_back_to_cost() {
        let mut record = ended_after(-10);
        assert_eq!(
            classify(&record).description,
            "No cost incurred - call not connected"
        );
        record.cost = Some(Decimal::new(25, 2));
        record.end_reason = Some("customer-ended-call".to_string());
        assert_eq!(classify(&record).description, "Call completed by customer");
    }

    #[test]
    fn progress_statuses() {
        let mut record = call_record("call-1");
        record.status = CallStatus::Queued;
        assert_eq!(classify(&record).status, OutcomeStatus::Ringing);
        record.status = CallStatus::Ringing;
        assert_eq!(classify(&record).status, OutcomeStatus::Ringing);
        record.status = CallStatus::InProgress;
        assert_eq!(classify(&record).status, OutcomeStatus::InProgress);
    }

    #[test]
    fn unknown_status_is_echoed() {
        let mut record = call_record("call-1");
        record.status = CallStatus::Other("scheduled".to_string());
        let outcome = classify(&record);
        assert_eq!(outcome.status, OutcomeStatus::Unknown);
        assert_eq!(outcome.description, "Unknown call status: scheduled");
    }

    #[test]
    fn thresholds_are_overridable() {
        let classifier = Classifier::new(Thresholds {
            short_call_secs: 35,
            ..Thresholds::default()
        });
        assert_eq!(
            classifier.classify(&ended_after(40)).status,
            OutcomeStatus::Answered
        );
        assert_eq!(classify(&ended_after(40)).status, OutcomeStatus::Voicemail);
    }

    #[test]
    fn classification_is_deterministic() {
        let record = with_transcript(
            ended_after(40),
            &[(Role::Assistant, "hi"), (Role::User, "hello")],
        );
        let first = classify(&record);
        for _ in 0..3 {
            assert_eq!(classify(&record), first);
        }
    }
}
