use std::sync::LazyLock;

use regex::{Captures, Regex};

static DOTTED_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([ap])\.\s?m\.?").expect("valid suffix regex"));
static SPACES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static SUFFIXED_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\s*(?:-|to|until)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b",
    )
    .expect("valid suffixed range regex")
});
static OPEN_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?::(\d{2}))?\s*(?:-|to|until)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b")
        .expect("valid open range regex")
});
static CLOCK_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\s*(?:-|to|until)\s*([01]?\d|2[0-3]):([0-5]\d)\b")
        .expect("valid clock range regex")
});
static SUFFIXED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").expect("valid suffixed time regex")
});
static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").expect("valid clock regex")
});
static NOON_MIDNIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(noon|midnight)\b").expect("valid keyword regex"));

/// One entry in the ordered time matcher list.
#[derive(Clone, Copy)]
pub struct TimeMatcher {
    pub name: &'static str,
    apply: fn(&str) -> Option<String>,
}

impl TimeMatcher {
    pub fn apply(&self, prepared: &str) -> Option<String> {
        (self.apply)(prepared)
    }
}

/// Time matchers in priority order.
pub const TIME_MATCHERS: &[TimeMatcher] = &[
    TimeMatcher { name: "sunset", apply: match_sunset },
    TimeMatcher { name: "suffixed-range", apply: match_suffixed_range },
    TimeMatcher { name: "open-range", apply: match_open_range },
    TimeMatcher { name: "clock-range", apply: match_clock_range },
    TimeMatcher { name: "suffixed", apply: match_suffixed },
    TimeMatcher { name: "clock", apply: match_clock },
    TimeMatcher { name: "noon-midnight", apply: match_noon_midnight },
];

/// Canonical start time: `7pm`, `7:30pm`, `7pm-11pm`, or the literal `sunset`.
pub fn parse_time(text: &str) -> Option<String> {
    match_time(text).map(|(_, t)| t)
}

pub fn match_time(text: &str) -> Option<(&'static str, String)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let prepared = prepare(trimmed);
    TIME_MATCHERS
        .iter()
        .find_map(|m| m.apply(&prepared).map(|t| (m.name, t)))
}

fn prepare(text: &str) -> String {
    let lowered = text
        .to_lowercase()
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace('\u{a0}', " ");
    let lowered = DOTTED_SUFFIX_RE.replace_all(&lowered, "${1}m");
    SPACES_RE.replace_all(lowered.trim(), " ").into_owned()
}

fn num(caps: &Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

fn twelve_hour(hour: u32, minute: Option<u32>, suffix: &str) -> Option<String> {
    if !(1..=12).contains(&hour) || minute.is_some_and(|m| m > 59) {
        return None;
    }
    Some(match minute {
        Some(m) => format!("{hour}:{m:02}{suffix}"),
        None => format!("{hour}{suffix}"),
    })
}

fn from_clock(hour: u32, minute: u32) -> Option<String> {
    if hour > 23 || minute > 59 {
        return None;
    }
    let suffix = if hour >= 12 { "pm" } else { "am" };
    let display = match hour % 12 {
        0 => 12,
        h => h,
    };
    twelve_hour(display, Some(minute), suffix)
}

fn match_sunset(text: &str) -> Option<String> {
    text.contains("sunset").then(|| "sunset".to_string())
}

fn match_suffixed_range(text: &str) -> Option<String> {
    SUFFIXED_RANGE_RE.captures_iter(text).find_map(|caps| {
        let start = twelve_hour(num(&caps, 1)?, num(&caps, 2), caps.get(3)?.as_str())?;
        let end = twelve_hour(num(&caps, 4)?, num(&caps, 5), caps.get(6)?.as_str())?;
        Some(format!("{start}-{end}"))
    })
}

fn match_open_range(text: &str) -> Option<String> {
    OPEN_RANGE_RE.captures_iter(text).find_map(|caps| {
        let suffix = caps.get(5)?.as_str();
        let start = twelve_hour(num(&caps, 1)?, num(&caps, 2), suffix)?;
        let end = twelve_hour(num(&caps, 3)?, num(&caps, 4), suffix)?;
        Some(format!("{start}-{end}"))
    })
}

fn match_clock_range(text: &str) -> Option<String> {
    CLOCK_RANGE_RE.captures_iter(text).find_map(|caps| {
        let start = from_clock(num(&caps, 1)?, num(&caps, 2)?)?;
        let end = from_clock(num(&caps, 3)?, num(&caps, 4)?)?;
        Some(format!("{start}-{end}"))
    })
}

fn match_suffixed(text: &str) -> Option<String> {
    SUFFIXED_RE
        .captures_iter(text)
        .find_map(|caps| twelve_hour(num(&caps, 1)?, num(&caps, 2), caps.get(3)?.as_str()))
}

fn match_clock(text: &str) -> Option<String> {
    CLOCK_RE
        .captures_iter(text)
        .find_map(|caps| from_clock(num(&caps, 1)?, num(&caps, 2)?))
}

fn match_noon_midnight(text: &str) -> Option<String> {
    let caps = NOON_MIDNIGHT_RE.captures(text)?;
    Some(match caps.get(1)?.as_str() {
        "noon" => "12pm".to_string(),
        _ => "12am".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_range_borrows_trailing_suffix() {
        assert_eq!(parse_time("7-11pm").as_deref(), Some("7pm-11pm"));
        assert_eq!(parse_time("7:30 - 10:00 PM").as_deref(), Some("7:30pm-10:00pm"));
    }

    #[test]
    fn suffixed_ranges_and_single_times() {
        assert_eq!(parse_time("8pm - 1am").as_deref(), Some("8pm-1am"));
        assert_eq!(parse_time("7:00 PM").as_deref(), Some("7:00pm"));
        assert_eq!(parse_time("Doors 6 p.m.").as_deref(), Some("6pm"));
        assert_eq!(parse_time("11AM").as_deref(), Some("11am"));
    }

    #[test]
    fn twenty_four_hour_times_convert() {
        assert_eq!(parse_time("19:30").as_deref(), Some("7:30pm"));
        assert_eq!(parse_time("00:15").as_deref(), Some("12:15am"));
        assert_eq!(parse_time("12:00").as_deref(), Some("12:00pm"));
        assert_eq!(parse_time("18:00-22:30").as_deref(), Some("6:00pm-10:30pm"));
    }

    #[test]
    fn sunset_passes_through() {
        assert_eq!(parse_time("Sunset").as_deref(), Some("sunset"));
        assert_eq!(parse_time("starts at sunset").as_deref(), Some("sunset"));
    }

    #[test]
    fn invalid_or_missing_times_are_absent() {
        assert_eq!(parse_time(""), None);
        assert_eq!(parse_time("TBA"), None);
        assert_eq!(parse_time("13pm"), None);
        assert_eq!(parse_time("noon").as_deref(), Some("12pm"));
    }
}
