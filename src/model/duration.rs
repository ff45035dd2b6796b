use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration as StdDuration;

#[derive(Debug, Snafu)]
pub enum DurationError {
    #[snafu(display("Invalid ISO 8601 duration '{text}': {message}"))]
    Iso8601 { text: String, message: String },
}

/// A DSL duration: either an ISO 8601 string (`PT30S`, `P1DT2H`) or an
/// inline object (`{seconds: 30}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Iso8601(String),
    Inline(DurationFields),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milliseconds: Option<f64>,
}

impl DurationSpec {
    /// Total duration. Inline fields are additive.
    pub fn to_duration(&self) -> Result<StdDuration, DurationError> {
        match self {
            DurationSpec::Iso8601(text) => parse_iso8601_duration(text),
            DurationSpec::Inline(fields) => {
                let mut total_ms = 0.0;
                total_ms += fields.days.unwrap_or(0.0) * 24.0 * 3600.0 * 1000.0;
                total_ms += fields.hours.unwrap_or(0.0) * 3600.0 * 1000.0;
                total_ms += fields.minutes.unwrap_or(0.0) * 60.0 * 1000.0;
                total_ms += fields.seconds.unwrap_or(0.0) * 1000.0;
                total_ms += fields.milliseconds.unwrap_or(0.0);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Ok(StdDuration::from_millis(total_ms.max(0.0) as u64))
            }
        }
    }

    #[must_use]
    pub fn from_seconds(seconds: u64) -> Self {
        DurationSpec::Inline(DurationFields {
            seconds: Some(seconds as f64),
            ..DurationFields::default()
        })
    }
}

/// Parse an ISO 8601 duration into a [`StdDuration`].
///
/// Supports day and time components: `P1D`, `PT5S`, `PT1M30S`, `P1DT2H`,
/// `PT0.5S`. Year/month components are rejected (calendar-dependent).
pub fn parse_iso8601_duration(text: &str) -> Result<StdDuration, DurationError> {
    let trimmed = text.trim();

    let Some(body) = trimmed.strip_prefix('P') else {
        return Err(DurationError::Iso8601 {
            text: text.to_string(),
            message: "must start with 'P'".to_string(),
        });
    };
    if body.is_empty() || body == "T" {
        return Err(DurationError::Iso8601 {
            text: text.to_string(),
            message: "no components specified".to_string(),
        });
    }

    let mut total_ms: f64 = 0.0;
    let mut current_num = String::new();
    let mut in_time = false;

    for ch in body.chars() {
        if ch == 'T' {
            if in_time {
                return Err(DurationError::Iso8601 {
                    text: text.to_string(),
                    message: "duplicate 'T' designator".to_string(),
                });
            }
            in_time = true;
            continue;
        }
        if ch.is_ascii_digit() || ch == '.' {
            current_num.push(ch);
            continue;
        }

        if current_num.is_empty() {
            return Err(DurationError::Iso8601 {
                text: text.to_string(),
                message: format!("designator '{ch}' without a value"),
            });
        }
        let value: f64 = current_num.parse().map_err(|_| DurationError::Iso8601 {
            text: text.to_string(),
            message: format!("invalid number '{current_num}'"),
        })?;
        current_num.clear();

        match (in_time, ch) {
            (false, 'D') => total_ms += value * 24.0 * 3600.0 * 1000.0,
            (true, 'H') => total_ms += value * 3600.0 * 1000.0,
            (true, 'M') => total_ms += value * 60.0 * 1000.0,
            (true, 'S') => total_ms += value * 1000.0,
            (false, 'Y' | 'M' | 'W') => {
                return Err(DurationError::Iso8601 {
                    text: text.to_string(),
                    message: format!("calendar designator '{ch}' is not supported"),
                });
            }
            (_, other) => {
                return Err(DurationError::Iso8601 {
                    text: text.to_string(),
                    message: format!("unsupported designator '{other}'"),
                });
            }
        }
    }

    if !current_num.is_empty() {
        return Err(DurationError::Iso8601 {
            text: text.to_string(),
            message: "trailing value without designator".to_string(),
        });
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(StdDuration::from_millis(total_ms as u64))
}
