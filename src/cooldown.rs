use crate::rules::Rule;
use std::collections::BTreeMap;
use std::time::Duration;

/// Parses `<integer><unit>` with unit one of `s`, `m`, `h`, `d`.
///
/// Anything else, overflow included, yields a zero cooldown.
pub fn parse_cooldown(text: &str) -> Duration {
    try_parse_cooldown(text).unwrap_or(Duration::ZERO)
}

/// Strict variant used by config linting. Durations whose millisecond value
/// does not fit in `i64` are rejected.
pub fn try_parse_cooldown(text: &str) -> Option<Duration> {
    let unit = text.chars().last()?;
    let digits = &text[..text.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        's' => value,
        'm' => value.checked_mul(60)?,
        'h' => value.checked_mul(3_600)?,
        'd' => value.checked_mul(86_400)?,
        _ => return None,
    };
    let duration = Duration::from_secs(secs);
    i64::try_from(duration.as_millis()).ok()?;
    Some(duration)
}

fn cooldown_millis(text: &str) -> i64 {
    try_parse_cooldown(text)
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

/// Last-triggered instant (epoch millis) per rule id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownTracker {
    last_triggered: BTreeMap<String, i64>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, i64>) -> Self {
        Self {
            last_triggered: entries,
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, i64> {
        &self.last_triggered
    }

    pub fn last_triggered(&self, rule_id: &str) -> Option<i64> {
        self.last_triggered.get(rule_id).copied()
    }

    pub fn is_in_cooldown(&self, rule: &Rule, now_ms: i64) -> bool {
        let Some(cooldown) = rule.cooldown.as_deref().filter(|c| !c.is_empty()) else {
            return false;
        };
        let cooldown_ms = cooldown_millis(cooldown);
        if cooldown_ms == 0 {
            return false;
        }
        match self.last_triggered(&rule.id) {
            Some(last) => now_ms.saturating_sub(last) < cooldown_ms,
            None => false,
        }
    }

    /// Overwrites the previous instant; only the latest trigger is kept.
    pub fn record(&mut self, rule: &Rule, now_ms: i64) {
        self.last_triggered.insert(rule.id.clone(), now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, cooldown: Option<&str>) -> Rule {
        Rule {
            id: id.to_string(),
            description: None,
            condition: "true".to_string(),
            cooldown: cooldown.map(str::to_string),
            severity: None,
            message: None,
            channel: "discord".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn parses_units() {
        assert_eq!(parse_cooldown("5m").as_millis(), 300_000);
        assert_eq!(parse_cooldown("1h").as_millis(), 3_600_000);
        assert_eq!(parse_cooldown("30s").as_millis(), 30_000);
        assert_eq!(parse_cooldown("2d").as_millis(), 172_800_000);
    }

    #[test]
    fn malformed_strings_parse_to_zero() {
        for bad in ["", "5", "m", "5 m", "5min", "-5m", "1.5h", "5M", "99999999999999999999s"] {
            assert_eq!(parse_cooldown(bad), Duration::ZERO, "input {bad:?}");
            assert!(try_parse_cooldown(bad).is_none(), "input {bad:?}");
        }
    }

    #[test]
    fn no_cooldown_never_suppresses() {
        let mut tracker = CooldownTracker::new();
        let r = rule("r", None);
        tracker.record(&r, 1_000);
        assert!(!tracker.is_in_cooldown(&r, 1_000));
        assert!(!tracker.is_in_cooldown(&r, 1_001));
    }

    #[test]
    fn malformed_cooldown_never_suppresses() {
        let mut tracker = CooldownTracker::new();
        let r = rule("r", Some("soon"));
        tracker.record(&r, 1_000);
        assert!(!tracker.is_in_cooldown(&r, 1_000));
    }

    #[test]
    fn first_trigger_is_never_in_cooldown() {
        let tracker = CooldownTracker::new();
        assert!(!tracker.is_in_cooldown(&rule("r", Some("5m")), 0));
    }

    #[test]
    fn window_boundary() {
        let mut tracker = CooldownTracker::new();
        let r = rule("r", Some("5m"));
        let t = 10_000_000;
        tracker.record(&r, t);
        assert!(tracker.is_in_cooldown(&r, t));
        assert!(tracker.is_in_cooldown(&r, t + 2 * 60_000));
        assert!(tracker.is_in_cooldown(&r, t + 300_000 - 1));
        assert!(!tracker.is_in_cooldown(&r, t + 300_000));
    }

    #[test]
    fn cooldown_beyond_millisecond_range_is_zero() {
        assert!(try_parse_cooldown("9223372036854775s").is_some());
        assert!(try_parse_cooldown("10000000000000000s").is_none());
        assert_eq!(parse_cooldown("10000000000000000s"), Duration::ZERO);

        let mut tracker = CooldownTracker::new();
        let huge = rule("r", Some("10000000000000000s"));
        tracker.record(&huge, 1_000);
        assert!(!tracker.is_in_cooldown(&huge, 1_001));

        let widest = rule("w", Some("9223372036854775s"));
        tracker.record(&widest, 1_000);
        assert!(tracker.is_in_cooldown(&widest, 1_001));
    }

    #[test]
    fn extreme_restored_instants_do_not_overflow() {
        let tracker = CooldownTracker::from_entries(
            [("past".to_string(), i64::MIN), ("future".to_string(), i64::MAX)]
                .into_iter()
                .collect(),
        );
        let now = 1_700_000_000_000;
        assert!(!tracker.is_in_cooldown(&rule("past", Some("5m")), now));
        assert!(tracker.is_in_cooldown(&rule("future", Some("5m")), now));
        assert!(!tracker.is_in_cooldown(&rule("past", Some("5m")), i64::MAX));
        assert!(tracker.is_in_cooldown(&rule("future", Some("5m")), i64::MIN));
    }

    #[test]
    fn record_overwrites() {
        let mut tracker = CooldownTracker::new();
        let r = rule("r", Some("1m"));
        tracker.record(&r, 1);
        tracker.record(&r, 2);
        assert_eq!(tracker.last_triggered("r"), Some(2));
        assert_eq!(tracker.entries().len(), 1);
    }
}
