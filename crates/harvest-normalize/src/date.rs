use std::sync::LazyLock;

use chrono::{Datelike, Duration, Local, Months, NaiveDate, Weekday};
use regex::{Captures, Regex};

const MONTH: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?";
const WEEKDAY: &str =
    r"(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tues|tue|wed|thurs|thur|thu|fri|sat|sun)";
const ORDINAL: &str = r"(?:st|nd|rd|th)?";

static ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("valid iso regex"));
static MONTH_DAY_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b{MONTH}\s+(\d{{1,2}}){ORDINAL},?\s+(\d{{4}})\b"))
        .expect("valid month-day-year regex")
});
static NUMERIC_MDY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4}|\d{2})\b").expect("valid numeric date regex")
});
static DAY_MONTH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b(\d{{1,2}}){ORDINAL}\s+(?:of\s+)?{MONTH},?\s+(\d{{4}})\b"))
        .expect("valid day-month-year regex")
});
static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b{MONTH}\s+(\d{{1,2}}){ORDINAL}\b")).expect("valid month-day regex")
});
static DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b(\d{{1,2}}){ORDINAL}\s+(?:of\s+)?{MONTH}(?:\s|,|$)"))
        .expect("valid day-month regex")
});
static WEEKDAY_NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:\b{WEEKDAY}\.?,?\s+)?\b(\d{{1,2}})/(\d{{1,2}})\b"))
        .expect("valid weekday numeric regex")
});
static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b(today|tonight|tomorrow|{WEEKDAY})\b")).expect("valid relative regex")
});
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b{MONTH}\s+(\d{{1,2}}){ORDINAL}(?:,?\s+(\d{{4}}))?\s*(?:-|to|through|thru|until)\s*(?:{MONTH}\s+)?(\d{{1,2}}){ORDINAL}(?:,?\s+(\d{{4}}))?"
    ))
    .expect("valid date range regex")
});
static SPACES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// One entry in the ordered date matcher list.
#[derive(Clone, Copy)]
pub struct DateMatcher {
    pub name: &'static str,
    apply: fn(&str, NaiveDate) -> Option<NaiveDate>,
}

impl DateMatcher {
    pub fn apply(&self, prepared: &str, today: NaiveDate) -> Option<NaiveDate> {
        (self.apply)(prepared, today)
    }
}

/// Single-date matchers in priority order. The first matcher that yields a valid
/// calendar date wins.
pub const DATE_MATCHERS: &[DateMatcher] = &[
    DateMatcher { name: "iso", apply: match_iso },
    DateMatcher { name: "month-day-year", apply: match_month_day_year },
    DateMatcher { name: "numeric-month-day-year", apply: match_numeric_mdy },
    DateMatcher { name: "day-month-year", apply: match_day_month_year },
    DateMatcher { name: "month-day", apply: match_month_day },
    DateMatcher { name: "day-month", apply: match_day_month },
    DateMatcher { name: "weekday-month-day", apply: match_weekday_numeric },
    DateMatcher { name: "relative", apply: match_relative },
];

/// Inclusive date interval parsed from range text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub fn today_local() -> NaiveDate {
    Local::now().date_naive()
}

/// Parses free-text date relative to the local calendar day.
pub fn parse_date(text: &str, hint_formats: &[String]) -> Option<NaiveDate> {
    parse_date_on(text, hint_formats, today_local())
}

/// Parses free-text date; `today` anchors year inference and relative tokens.
pub fn parse_date_on(text: &str, hint_formats: &[String], today: NaiveDate) -> Option<NaiveDate> {
    match_date(text, hint_formats, today).map(|(_, date)| date)
}

/// Like [`parse_date_on`] but also reports which matcher accepted the text.
pub fn match_date(
    text: &str,
    hint_formats: &[String],
    today: NaiveDate,
) -> Option<(&'static str, NaiveDate)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(date) = parse_with_hints(trimmed, hint_formats, today) {
        return Some(("hint", date));
    }

    let prepared = prepare(trimmed);

    // A range yields only its start so the end endpoint never wins a single-date match.
    if let Some(range) = range_in_prepared(&prepared, today) {
        return Some(("range", range.start));
    }

    DATE_MATCHERS
        .iter()
        .find_map(|m| m.apply(&prepared, today).map(|d| (m.name, d)))
}

/// First per-source `chrono` format that accepts the whole text. Formats without a
/// year get [`infer_year`].
pub fn parse_with_hints(text: &str, hint_formats: &[String], today: NaiveDate) -> Option<NaiveDate> {
    let trimmed = text.trim();
    hint_formats
        .iter()
        .find_map(|hint| parse_with_hint(trimmed, hint, today))
}

pub fn parse_date_range(text: &str) -> Option<DateRange> {
    parse_date_range_on(text, today_local())
}

/// Detects `Month D - Month D` (or `Month D-D`) text. Both ends get year inference
/// independently and the result is reordered so that `start <= end`.
pub fn parse_date_range_on(text: &str, today: NaiveDate) -> Option<DateRange> {
    range_in_prepared(&prepare(text), today)
}

/// Year inference for year-less dates: assume the current year unless that lands more
/// than six months in the past, in which case roll forward one year.
pub fn infer_year(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    let year = today.year();
    let candidate = match NaiveDate::from_ymd_opt(year, month, day) {
        Some(d) => d,
        None => return NaiveDate::from_ymd_opt(year + 1, month, day),
    };
    let cutoff = today.checked_sub_months(Months::new(6))?;
    if candidate < cutoff {
        NaiveDate::from_ymd_opt(year + 1, month, day)
    } else {
        Some(candidate)
    }
}

fn prepare(text: &str) -> String {
    let lowered = text
        .to_lowercase()
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace('\u{a0}', " ");
    SPACES_RE.replace_all(lowered.trim(), " ").into_owned()
}

fn parse_with_hint(text: &str, format: &str, today: NaiveDate) -> Option<NaiveDate> {
    if format.contains("%Y") || format.contains("%y") {
        return NaiveDate::parse_from_str(text, format).ok();
    }
    // chrono needs a year to build a date; parse against a leap year then infer.
    let padded_text = format!("{text} 2000");
    let padded_format = format!("{format} %Y");
    let parsed = NaiveDate::parse_from_str(&padded_text, &padded_format).ok()?;
    infer_year(parsed.month(), parsed.day(), today)
}

fn month_number(token: &str) -> Option<u32> {
    let month = match token.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn weekday_from(token: &str) -> Option<Weekday> {
    let weekday = match token.get(..3)? {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(weekday)
}

fn num(caps: &Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

fn year(caps: &Captures<'_>, idx: usize) -> Option<i32> {
    let raw = caps.get(idx)?.as_str();
    let value: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { 2000 + value } else { value })
}

fn match_iso(text: &str, _today: NaiveDate) -> Option<NaiveDate> {
    ISO_RE.captures_iter(text).find_map(|caps| {
        let y: i32 = caps.get(1)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(y, num(&caps, 2)?, num(&caps, 3)?)
    })
}

fn match_month_day_year(text: &str, _today: NaiveDate) -> Option<NaiveDate> {
    MONTH_DAY_YEAR_RE.captures_iter(text).find_map(|caps| {
        let month = month_number(caps.get(1)?.as_str())?;
        NaiveDate::from_ymd_opt(year(&caps, 3)?, month, num(&caps, 2)?)
    })
}

fn match_numeric_mdy(text: &str, _today: NaiveDate) -> Option<NaiveDate> {
    NUMERIC_MDY_RE.captures_iter(text).find_map(|caps| {
        NaiveDate::from_ymd_opt(year(&caps, 3)?, num(&caps, 1)?, num(&caps, 2)?)
    })
}

fn match_day_month_year(text: &str, _today: NaiveDate) -> Option<NaiveDate> {
    DAY_MONTH_YEAR_RE.captures_iter(text).find_map(|caps| {
        let month = month_number(caps.get(2)?.as_str())?;
        NaiveDate::from_ymd_opt(year(&caps, 3)?, month, num(&caps, 1)?)
    })
}

fn match_month_day(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    MONTH_DAY_RE.captures_iter(text).find_map(|caps| {
        let month = month_number(caps.get(1)?.as_str())?;
        infer_year(month, num(&caps, 2)?, today)
    })
}

fn match_day_month(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    DAY_MONTH_RE.captures_iter(text).find_map(|caps| {
        let month = month_number(caps.get(2)?.as_str())?;
        infer_year(month, num(&caps, 1)?, today)
    })
}

fn match_weekday_numeric(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    WEEKDAY_NUMERIC_RE
        .captures_iter(text)
        .find_map(|caps| infer_year(num(&caps, 2)?, num(&caps, 3)?, today))
}

fn match_relative(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let caps = RELATIVE_RE.captures(text)?;
    match caps.get(1)?.as_str() {
        "today" | "tonight" => Some(today),
        "tomorrow" => today.checked_add_signed(Duration::days(1)),
        token => {
            let target = weekday_from(token)?;
            let ahead = (7 + target.num_days_from_monday() as i64
                - today.weekday().num_days_from_monday() as i64)
                % 7;
            today.checked_add_signed(Duration::days(ahead))
        }
    }
}

fn range_in_prepared(prepared: &str, today: NaiveDate) -> Option<DateRange> {
    let caps = RANGE_RE.captures(prepared)?;
    let whole = caps.get(0)?;

    // "June 15 - 7pm" is a date followed by a time, not a range.
    let rest = prepared[whole.end()..].trim_start();
    if rest.starts_with(':')
        || rest.starts_with("am")
        || rest.starts_with("pm")
        || rest.starts_with("a.m")
        || rest.starts_with("p.m")
    {
        return None;
    }

    let start_month = month_number(caps.get(1)?.as_str())?;
    let start_day = num(&caps, 2)?;
    let start_year = year(&caps, 3);
    let end_month = match caps.get(4) {
        Some(m) => month_number(m.as_str())?,
        None => start_month,
    };
    let end_day = num(&caps, 5)?;
    let end_year = year(&caps, 6);

    let (start, end) = match (start_year, end_year) {
        (None, None) => (
            infer_year(start_month, start_day, today)?,
            infer_year(end_month, end_day, today)?,
        ),
        (Some(sy), Some(ey)) => (
            NaiveDate::from_ymd_opt(sy, start_month, start_day)?,
            NaiveDate::from_ymd_opt(ey, end_month, end_day)?,
        ),
        (Some(sy), None) => (
            NaiveDate::from_ymd_opt(sy, start_month, start_day)?,
            NaiveDate::from_ymd_opt(sy, end_month, end_day)?,
        ),
        (None, Some(ey)) => {
            // "Dec 30 - Jan 2, 2025" puts the start in the previous year.
            let sy = if start_month > end_month { ey - 1 } else { ey };
            (
                NaiveDate::from_ymd_opt(sy, start_month, start_day)?,
                NaiveDate::from_ymd_opt(ey, end_month, end_day)?,
            )
        }
    };

    if start <= end {
        Some(DateRange { start, end })
    } else {
        Some(DateRange { start: end, end: start })
    }
}
