use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Outcome of one test script in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub file_name: String,
    pub time_ms: u64,
    /// The timeout that fired, if the script was killed for running too long.
    #[serde(with = "optional_secs")]
    pub timeout: Option<Duration>,
    pub tests: Vec<Value>,
    pub stderr: Option<String>,
    /// The full stdout when it was not a clean sequence of JSON objects.
    pub malformed: Option<String>,
}

/// Build the result for one script from its raw output.
pub fn parse_output(
    file_name: &str,
    stdout: &str,
    stderr: &str,
    time_ms: u64,
    timeout: Option<Duration>,
) -> ExecutionResult {
    let (tests, malformed) = loads_partial_json(stdout);
    ExecutionResult {
        file_name: file_name.to_string(),
        time_ms,
        timeout,
        tests,
        stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
        malformed: malformed.then(|| stdout.to_string()),
    }
}

/// Decode as many JSON objects as possible from `text`.
///
/// Decoding is attempted at each unconsumed position, left to right. Values
/// that are not objects are dropped, and they (like any non-whitespace that
/// does not decode) mark the text as malformed. Never fails.
pub fn loads_partial_json(text: &str) -> (Vec<Value>, bool) {
    let mut objects = Vec::new();
    let mut malformed = false;
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            None => break,
            Some(Ok(value)) => {
                if value.is_object() {
                    objects.push(value);
                } else {
                    malformed = true;
                }
                pos += stream.byte_offset().max(1);
            }
            Some(Err(_)) => {
                let Some(ch) = rest.chars().next() else {
                    break;
                };
                if !ch.is_whitespace() {
                    malformed = true;
                }
                pos += ch.len_utf8();
            }
        }
    }
    (objects, malformed)
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}
