use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

pub const DECISION_SCORE_MIN: u8 = 1;
pub const DECISION_SCORE_MAX: u8 = 10;
pub const DEFAULT_ESCALATION_THRESHOLD: u8 = 6;

/// Structured result of the reply-drafting stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub score: u8,
    pub reason: String,
    pub reply: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionDecodeError {
    #[error("reply-drafting output is empty")]
    Empty,
    #[error("reply-drafting output is not json: {0}")]
    NotJson(String),
    #[error("reply-drafting output does not match decision schema: {0}")]
    Schema(String),
    #[error("escalation score {0} is outside 1..=10")]
    ScoreOutOfRange(i64),
}

#[derive(Debug, Deserialize)]
struct DecisionPayload {
    #[serde(alias = "need_human_reply_score")]
    score: i64,
    reason: String,
    #[serde(alias = "response")]
    reply: String,
}

impl Decision {
    /// Decodes the reply-drafting output against the `{score, reason, reply}`
    /// schema. Missing fields or an out-of-range score are errors; nothing is
    /// defaulted.
    pub fn decode(raw: &str) -> Result<Decision, DecisionDecodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DecisionDecodeError::Empty);
        }

        let value = match serde_json::from_str::<Json>(trimmed) {
            Ok(value) => value,
            Err(err) => match try_extract_json_block(trimmed) {
                Some(value) => value,
                None => return Err(DecisionDecodeError::NotJson(err.to_string())),
            },
        };

        let payload: DecisionPayload = serde_json::from_value(value)
            .map_err(|err| DecisionDecodeError::Schema(err.to_string()))?;

        let min = DECISION_SCORE_MIN as i64;
        let max = DECISION_SCORE_MAX as i64;
        if payload.score < min || payload.score > max {
            return Err(DecisionDecodeError::ScoreOutOfRange(payload.score));
        }

        Ok(Decision {
            score: payload.score as u8,
            reason: payload.reason,
            reply: payload.reply,
        })
    }
}

fn try_extract_json_block(content: &str) -> Option<Json> {
    let fence_parts: Vec<&str> = content.split("```").collect();
    if fence_parts.len() >= 3 {
        for segment in fence_parts.iter().skip(1).step_by(2) {
            let trimmed = segment.trim();
            let payload = trimmed.strip_prefix("json").unwrap_or(trimmed).trim();
            if let Ok(value) = serde_json::from_str::<Json>(payload) {
                return Some(value);
            }
        }
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Json>(&content[start..=end]).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Escalate,
    AutoReply,
}

/// Escalation gate: a decision whose score reaches the threshold goes to a
/// human, anything below is answered autonomously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    threshold: u8,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }
}

impl EscalationPolicy {
    pub fn new(threshold: u8) -> Result<Self, String> {
        if !(DECISION_SCORE_MIN..=DECISION_SCORE_MAX).contains(&threshold) {
            return Err(format!(
                "escalation threshold {} must be within {}..={}",
                threshold, DECISION_SCORE_MIN, DECISION_SCORE_MAX
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn route(&self, decision: &Decision) -> Route {
        if decision.score >= self.threshold {
            Route::Escalate
        } else {
            Route::AutoReply
        }
    }
}
