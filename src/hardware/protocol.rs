//! Verified request/response exchange.
//!
//! The modulator controller answers every command with `[GROUP](VALUE)`. A [`Query`]
//! carries the expected group tag and, for set commands, the value the device has to echo
//! back. [`exchange`] retries on transport errors and on mismatching replies, and turns an
//! exhausted retry bound into [`DaqError::Communication`].
//!
//! The monochromator uses a weaker variant: any reply containing a literal success marker
//! counts as acknowledged ([`ok_exchange`]).
//!
//! Every attempt is logged as a `<<` / `>>` pair at debug level.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::LineTransport;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

static REPLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("Invalid reply regex"));

/// What a reply must contain besides the group tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// Get query: the group tag alone decides
    Group,
    /// Set query with an integer argument, echoed exactly
    Int(i64),
    /// Set query with a float argument, echoed within `tolerance`
    Float { value: f64, tolerance: f64 },
}

/// One outbound command and the acceptance rule for its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Command line sent to the device, without terminator
    pub command: String,
    /// Group tag the reply must carry
    pub group: String,
    pub expect: Expectation,
    /// Attempts before the exchange gives up
    pub max_attempts: u32,
}

impl Query {
    /// Attempts used unless [`with_attempts`](Self::with_attempts) says otherwise
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    /// Read query: any reply with the right group is accepted.
    pub fn get(command: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            group: group.into(),
            expect: Expectation::Group,
            max_attempts: Self::DEFAULT_ATTEMPTS,
        }
    }

    /// Set query whose reply echoes `value` exactly.
    pub fn set_int(command: impl Into<String>, group: impl Into<String>, value: i64) -> Self {
        Self {
            expect: Expectation::Int(value),
            ..Self::get(command, group)
        }
    }

    /// Set query whose reply echoes `value` within `tolerance`.
    pub fn set_float(
        command: impl Into<String>,
        group: impl Into<String>,
        value: f64,
        tolerance: f64,
    ) -> Self {
        Self {
            expect: Expectation::Float { value, tolerance },
            ..Self::get(command, group)
        }
    }

    /// Override the attempt bound; at least one attempt is made.
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// A parsed `[GROUP](VALUE)` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Text between the brackets
    pub group: String,
    /// Text between the parentheses
    pub value: String,
    /// The whole line as received
    pub raw: String,
}

impl Reply {
    /// `None` unless the line contains a `[GROUP](VALUE)` pattern.
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = REPLY_RE.captures(raw)?;
        Some(Self {
            group: caps.get(1)?.as_str().to_string(),
            value: caps.get(2)?.as_str().to_string(),
            raw: raw.to_string(),
        })
    }

    /// Value as a float
    pub fn as_f64(&self) -> AppResult<f64> {
        self.value.trim().parse::<f64>().map_err(|_| {
            DaqError::Instrument(format!("non-numeric value in reply '{}'", self.raw))
        })
    }

    /// Value as an integer
    pub fn as_i64(&self) -> AppResult<i64> {
        self.value.trim().parse::<i64>().map_err(|_| {
            DaqError::Instrument(format!("non-integer value in reply '{}'", self.raw))
        })
    }

    /// Value of the form `a,b`
    pub fn as_pair(&self) -> AppResult<(f64, f64)> {
        let invalid = || DaqError::Instrument(format!("expected a value pair in '{}'", self.raw));
        let (a, b) = self.value.split_once(',').ok_or_else(invalid)?;
        let a = a.trim().parse::<f64>().map_err(|_| invalid())?;
        let b = b.trim().parse::<f64>().map_err(|_| invalid())?;
        Ok((a, b))
    }
}

/// Check a raw reply against a query.
pub fn validate_reply(device: &str, query: &Query, raw: &str) -> AppResult<Reply> {
    let mismatch = || DaqError::Validation {
        device: device.to_string(),
        query: query.command.clone(),
        response: raw.to_string(),
    };

    let reply = Reply::parse(raw).ok_or_else(mismatch)?;
    if reply.group != query.group {
        return Err(mismatch());
    }

    let accepted = match &query.expect {
        Expectation::Group => true,
        Expectation::Int(expected) => reply.as_i64().map(|v| v == *expected).unwrap_or(false),
        Expectation::Float { value, tolerance } => reply
            .as_f64()
            .map(|v| (v - value).abs() <= *tolerance)
            .unwrap_or(false),
    };

    if accepted {
        Ok(reply)
    } else {
        Err(mismatch())
    }
}

/// Send `query` until a reply validates or the attempt bound is reached.
pub async fn exchange(
    transport: &mut dyn LineTransport,
    device: &str,
    query: &Query,
) -> AppResult<Reply> {
    let attempts = query.max_attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        debug!(device, "<< {}", query.command);
        match transport.query(&query.command).await {
            Ok(raw) => {
                debug!(device, ">> {}", raw);
                match validate_reply(device, query, &raw) {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        warn!(device, attempt, "{}", e);
                        last_reason = format!("unexpected reply '{}'", raw);
                    }
                }
            }
            Err(e) => {
                warn!(
                    device,
                    attempt, "Error with query {}: {:#}", query.command, e
                );
                last_reason = format!("{:#}", e);
            }
        }
    }

    Err(DaqError::Communication {
        device: device.to_string(),
        query: query.command.clone(),
        attempts,
        reason: last_reason,
    })
}

/// Send `command` until the reply contains `marker`.
pub async fn ok_exchange(
    transport: &mut dyn LineTransport,
    device: &str,
    command: &str,
    marker: &str,
    max_attempts: u32,
) -> AppResult<String> {
    let attempts = max_attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        debug!(device, "<< {}", command);
        match transport.query(command).await {
            Ok(raw) => {
                debug!(device, ">> {}", raw);
                if raw.contains(marker) {
                    return Ok(raw);
                }
                warn!(device, attempt, "no '{}' in reply to {}: {}", marker, command, raw);
                last_reason = format!("unexpected reply '{}'", raw);
            }
            Err(e) => {
                warn!(device, attempt, "Error with query {}: {:#}", command, e);
                last_reason = format!("{:#}", e);
            }
        }
    }

    Err(DaqError::Communication {
        device: device.to_string(),
        query: command.to_string(),
        attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays scripted replies; `None` is a transport error.
    struct Scripted {
        replies: VecDeque<Option<String>>,
        sent: Vec<String>,
    }

    impl Scripted {
        fn new(replies: &[Option<&str>]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.map(str::to_string)).collect(),
                sent: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl LineTransport for Scripted {
        async fn query(&mut self, command: &str) -> anyhow::Result<String> {
            self.sent.push(command.to_string());
            match self.replies.pop_front() {
                Some(Some(reply)) => Ok(reply),
                _ => Err(anyhow!("read timeout")),
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parses_group_and_value() {
        let reply = Reply::parse("[AMP](125.00)").unwrap();
        assert_eq!(reply.group, "AMP");
        assert_eq!(reply.as_f64().unwrap(), 125.0);

        let pair = Reply::parse("[CPE](0.5,0.02)").unwrap();
        assert_eq!(pair.as_pair().unwrap(), (0.5, 0.02));

        assert!(Reply::parse("garbage").is_none());
    }

    #[test]
    fn float_echo_within_tolerance() {
        let query = Query::set_float(":MOD:AMP 125.00", "AMP", 125.0, 0.025);
        assert!(validate_reply("PEM", &query, "[AMP](125.02)").is_ok());
        assert!(matches!(
            validate_reply("PEM", &query, "[AMP](125.10)"),
            Err(DaqError::Validation { .. })
        ));
        assert!(validate_reply("PEM", &query, "[DRIVE](125.00)").is_err());
    }

    #[test]
    fn int_echo_must_match_exactly() {
        let query = Query::set_int(":SYS:PEMO 1", "PEMOUT", 1);
        assert!(validate_reply("PEM", &query, "[PEMOUT](1)").is_ok());
        assert!(validate_reply("PEM", &query, "[PEMOUT](0)").is_err());
    }

    #[tokio::test]
    async fn retries_after_mismatch_and_transport_error() {
        let mut transport = Scripted::new(&[None, Some("[FREQ](x)"), Some("[FREQUENCY](50000)")]);
        let query = Query::get(":MOD:FREQ?", "FREQUENCY");
        let reply = exchange(&mut transport, "PEM", &query).await.unwrap();
        assert_eq!(reply.as_f64().unwrap(), 50000.0);
        assert_eq!(transport.sent.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_communication_failure() {
        let mut transport = Scripted::new(&[None, None, None, Some("[IDN](late)")]);
        let query = Query::get("*IDN?", "IDN");
        let err = exchange(&mut transport, "PEM", &query).await.unwrap_err();
        match err {
            DaqError::Communication { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport.sent.len(), 3);
    }

    #[tokio::test]
    async fn ok_marker_anywhere_in_reply() {
        let mut transport = Scripted::new(&[Some("  500.00 nm"), Some(" 500.00 nm  ok")]);
        let reply = ok_exchange(&mut transport, "MON", "500.00 GOTO", "ok", 3)
            .await
            .unwrap();
        assert!(reply.ends_with("ok"));
        assert_eq!(transport.sent, vec!["500.00 GOTO", "500.00 GOTO"]);
    }
}
