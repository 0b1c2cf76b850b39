//! Configuration Module
//!
//! Loads memoizer options and validates them into an [`ExpiryPolicy`].
//!
//! Options arrive loosely typed (builder calls, JSON documents, environment
//! variables), so both fields are kept as raw JSON values until
//! [`Options::validate`] turns them into a policy.

use std::env;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{MemoizeError, Result};

/// Environment variable holding the max age in milliseconds
pub const MAX_AGE_ENV: &str = "MEMOIZE_MAX_AGE";
/// Environment variable holding the expiration date
pub const EXPIRATION_DATE_ENV: &str = "MEMOIZE_EXPIRATION_DATE";

// == Options ==
/// Memoizer options, as supplied by the caller.
///
/// `max_age` and `expiration_date` are mutually exclusive. A field counts as
/// absent when it is missing, `null`, `false`, `0` or an empty string.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Cache max age in milliseconds
    #[serde(default)]
    pub max_age: Option<Value>,
    /// Absolute instant after which cached results are dropped
    #[serde(default)]
    pub expiration_date: Option<Value>,
}

impl Options {
    // == Constructor ==
    /// Creates empty options: results are cached for the wrapper's lifetime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the max age in milliseconds.
    pub fn max_age(mut self, millis: u64) -> Self {
        self.max_age = Some(Value::from(millis));
        self
    }

    /// Sets the expiration instant.
    pub fn expiration_date(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(Value::String(
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
        ));
        self
    }

    // == From Env ==
    /// Loads options from environment variables.
    ///
    /// # Environment Variables
    /// - `MEMOIZE_MAX_AGE` - Max age in milliseconds
    /// - `MEMOIZE_EXPIRATION_DATE` - Expiration date (RFC 3339, date-time or date)
    ///
    /// Values that do not look like integers are kept as text so that
    /// [`Options::validate`] reports them.
    pub fn from_env() -> Self {
        Self {
            max_age: env::var(MAX_AGE_ENV).ok().map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or(Value::String(raw))
            }),
            expiration_date: env::var(EXPIRATION_DATE_ENV).ok().map(Value::String),
        }
    }

    // == From Json ==
    /// Parses a JSON options object such as `{"maxAge": 1000}`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| MemoizeError::InvalidConfig(err.to_string()))
    }

    // == Validate ==
    /// Checks option consistency and resolves the expiry policy.
    ///
    /// Conflicting options are reported before either value is inspected.
    pub fn validate(&self) -> Result<ExpiryPolicy> {
        let max_age = present(&self.max_age);
        let expiration_date = present(&self.expiration_date);

        match (max_age, expiration_date) {
            (Some(_), Some(_)) => Err(MemoizeError::ConflictingOptions),
            (Some(value), None) => parse_max_age(value).map(ExpiryPolicy::MaxAge),
            (None, Some(value)) => parse_expiration_date(value).map(ExpiryPolicy::ExpiresAt),
            (None, None) => Ok(ExpiryPolicy::Never),
        }
    }
}

// == Expiry Policy ==
/// How long a stored result stays in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Entries live as long as the wrapper
    Never,
    /// Entries are removed this long after being stored
    MaxAge(Duration),
    /// Entries are removed at this instant
    ExpiresAt(DateTime<Utc>),
}

impl ExpiryPolicy {
    /// Returns how long after `stored_at` an entry must be removed, or `None`
    /// if it never expires.
    ///
    /// For [`ExpiryPolicy::ExpiresAt`] this is the absolute distance between
    /// the two instants, rounded up to a whole millisecond. An expiration
    /// date already in the past yields the size of the gap, not zero.
    pub fn delay_from(&self, stored_at: DateTime<Utc>) -> Option<Duration> {
        match self {
            ExpiryPolicy::Never => None,
            ExpiryPolicy::MaxAge(max_age) => Some(*max_age),
            ExpiryPolicy::ExpiresAt(at) => {
                let gap = if *at >= stored_at {
                    *at - stored_at
                } else {
                    stored_at - *at
                };
                Some(ceil_millis(gap))
            }
        }
    }
}

/// Converts a non-negative gap to whole milliseconds, rounding any
/// fraction up so a timer never fires before the gap has passed.
fn ceil_millis(gap: TimeDelta) -> Duration {
    let whole = gap.num_milliseconds();
    let partial = TimeDelta::try_milliseconds(whole).is_some_and(|floor| floor < gap);
    let millis = if partial { whole.saturating_add(1) } else { whole };
    Duration::from_millis(millis.unsigned_abs())
}

fn present(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|value| is_truthy(value))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map_or(true, |n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_max_age(value: &Value) -> Result<Duration> {
    let Value::Number(number) = value else {
        return Err(MemoizeError::invalid_max_age("an integer"));
    };

    if let Some(millis) = number.as_u64() {
        return Ok(Duration::from_millis(millis));
    }
    if number.is_i64() {
        return Err(MemoizeError::invalid_max_age("a positive integer"));
    }

    match number.as_f64() {
        Some(n) if n.fract() == 0.0 && n > 0.0 && n <= u64::MAX as f64 => {
            Ok(Duration::from_millis(n as u64))
        }
        Some(n) if n.fract() == 0.0 => Err(MemoizeError::invalid_max_age("a positive integer")),
        _ => Err(MemoizeError::invalid_max_age("an integer")),
    }
}

fn parse_expiration_date(value: &Value) -> Result<DateTime<Utc>> {
    let parsed = match value {
        Value::String(text) => parse_date_text(text.trim()),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|n| n.is_finite()).map(|n| n as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    };

    parsed.ok_or_else(MemoizeError::invalid_expiration_date)
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_options_default_never_expires() {
        assert_eq!(Options::default().validate(), Ok(ExpiryPolicy::Never));
    }

    #[test]
    fn test_max_age_builder() {
        let policy = Options::new().max_age(1000).validate().unwrap();
        assert_eq!(policy, ExpiryPolicy::MaxAge(Duration::from_millis(1000)));
    }

    #[test]
    fn test_expiration_date_builder() {
        let at = utc("2022-04-13T00:00:00.000+09:00");
        let policy = Options::new().expiration_date(at).validate().unwrap();
        assert_eq!(policy, ExpiryPolicy::ExpiresAt(at));
    }

    #[test]
    fn test_max_age_string_is_invalid() {
        let options = Options {
            max_age: Some(json!("1000")),
            ..Options::default()
        };
        let err = options.validate().unwrap_err();
        assert_eq!(err, MemoizeError::invalid_max_age("an integer"));
        assert!(err.to_string().contains("maxAge"));
    }

    #[test]
    fn test_max_age_fraction_is_invalid() {
        let options = Options {
            max_age: Some(json!(10.5)),
            ..Options::default()
        };
        assert!(matches!(
            options.validate(),
            Err(MemoizeError::InvalidOption { option: "maxAge", .. })
        ));
    }

    #[test]
    fn test_max_age_integral_float_is_accepted() {
        let options = Options {
            max_age: Some(json!(1000.0)),
            ..Options::default()
        };
        assert_eq!(
            options.validate(),
            Ok(ExpiryPolicy::MaxAge(Duration::from_millis(1000)))
        );
    }

    #[test]
    fn test_max_age_negative_is_invalid() {
        let options = Options {
            max_age: Some(json!(-5)),
            ..Options::default()
        };
        assert_eq!(
            options.validate(),
            Err(MemoizeError::invalid_max_age("a positive integer"))
        );
    }

    #[test]
    fn test_falsy_values_are_absent() {
        for value in [json!(null), json!(0), json!(false), json!("")] {
            let options = Options {
                max_age: Some(value.clone()),
                expiration_date: Some(value),
            };
            assert_eq!(options.validate(), Ok(ExpiryPolicy::Never));
        }
    }

    #[test]
    fn test_expiration_date_unparseable() {
        let options = Options {
            expiration_date: Some(json!("abcde")),
            ..Options::default()
        };
        let err = options.validate().unwrap_err();
        assert_eq!(err, MemoizeError::invalid_expiration_date());
        assert!(err.to_string().contains("expirationDate"));
    }

    #[test]
    fn test_expiration_date_forms() {
        let cases = [
            (json!("2022-04-13T00:00:00.000+09:00"), utc("2022-04-12T15:00:00Z")),
            (json!("2022-04-13T00:00:00"), utc("2022-04-13T00:00:00Z")),
            (json!("2022-04-13"), utc("2022-04-13T00:00:00Z")),
            (json!(1_649_775_600_000_i64), utc("2022-04-12T15:00:00Z")),
        ];

        for (value, expected) in cases {
            let options = Options {
                expiration_date: Some(value),
                ..Options::default()
            };
            assert_eq!(options.validate(), Ok(ExpiryPolicy::ExpiresAt(expected)));
        }
    }

    #[test]
    fn test_conflict_checked_before_validity() {
        let options = Options {
            max_age: Some(json!("not a number")),
            expiration_date: Some(json!("abcde")),
        };
        assert_eq!(options.validate(), Err(MemoizeError::ConflictingOptions));

        let options = Options {
            max_age: Some(json!(1000)),
            expiration_date: Some(json!("2022-04-13T00:00:00.000+09:00")),
        };
        assert_eq!(options.validate(), Err(MemoizeError::ConflictingOptions));
    }

    #[test]
    fn test_from_json() {
        let options = Options::from_json(r#"{"maxAge": 250}"#).unwrap();
        assert_eq!(
            options.validate(),
            Ok(ExpiryPolicy::MaxAge(Duration::from_millis(250)))
        );

        let options = Options::from_json(r#"{"expirationDate": "2030-01-01"}"#).unwrap();
        assert_eq!(
            options.validate(),
            Ok(ExpiryPolicy::ExpiresAt(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()))
        );
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        let result = Options::from_json(r#"{"ttl": 5}"#);
        assert!(matches!(result, Err(MemoizeError::InvalidConfig(_))));
    }

    #[test]
    fn test_options_from_env() {
        env::set_var(MAX_AGE_ENV, "1500");
        env::remove_var(EXPIRATION_DATE_ENV);
        let options = Options::from_env();
        assert_eq!(options.max_age, Some(json!(1500)));
        assert_eq!(options.expiration_date, None);

        env::set_var(MAX_AGE_ENV, "soon");
        let options = Options::from_env();
        assert_eq!(options.max_age, Some(json!("soon")));
        assert!(options.validate().is_err());

        env::remove_var(MAX_AGE_ENV);
        assert_eq!(Options::from_env(), Options::default());
    }

    #[test]
    fn test_delay_from_max_age() {
        let policy = ExpiryPolicy::MaxAge(Duration::from_millis(5000));
        assert_eq!(
            policy.delay_from(Utc::now()),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(ExpiryPolicy::Never.delay_from(Utc::now()), None);
    }

    #[test]
    fn test_delay_from_future_date() {
        let policy = ExpiryPolicy::ExpiresAt(utc("2022-04-13T00:00:00.000+09:00"));
        let now = utc("2022-04-12T23:59:00.000+09:00");
        assert_eq!(policy.delay_from(now), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_delay_from_past_date_uses_absolute_gap() {
        let policy = ExpiryPolicy::ExpiresAt(utc("2022-04-13T00:00:00.000+09:00"));
        let now = utc("2022-04-13T00:00:10.000+09:00");
        assert_eq!(policy.delay_from(now), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_delay_from_rounds_partial_millisecond_up() {
        let policy = ExpiryPolicy::ExpiresAt(utc("2022-04-13T00:00:00.000Z"));

        let just_before = utc("2022-04-12T23:59:00.000Z") + TimeDelta::microseconds(500);
        assert_eq!(policy.delay_from(just_before), Some(Duration::from_millis(60_000)));

        let just_after = utc("2022-04-13T00:00:10.000Z") + TimeDelta::nanoseconds(1);
        assert_eq!(policy.delay_from(just_after), Some(Duration::from_millis(10_001)));

        let exact = utc("2022-04-12T23:59:59.999Z");
        assert_eq!(policy.delay_from(exact), Some(Duration::from_millis(1)));
    }
}
