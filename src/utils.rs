use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use num_format::{Locale, ToFormattedString};
use xxhash_rust::xxh3::xxh3_64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone)]
pub struct NumberFormatOptions {
    pub use_comma: bool,
    pub use_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl Default for NumberFormatOptions {
    fn default() -> Self {
        Self {
            use_comma: true,
            use_human: false,
            locale: "en".to_string(),
            decimal_places: 2,
        }
    }
}

/// Format a number for display. Accepts both u32 and u64.
pub fn format_number(n: impl Into<u64>, options: &NumberFormatOptions) -> String {
    let n: u64 = n.into();
    let locale = match options.locale.as_str() {
        "de" => Locale::de,
        "fr" => Locale::fr,
        "es" => Locale::es,
        "ja" => Locale::ja,
        _ => Locale::en,
    };

    if options.use_human {
        let scaled = [
            (1_000_000_000_000u64, "t"),
            (1_000_000_000, "b"),
            (1_000_000, "m"),
            (1_000, "k"),
        ]
        .into_iter()
        .find(|(unit, _)| n >= *unit);

        match scaled {
            Some((unit, suffix)) => format!(
                "{:.prec$}{suffix}",
                n as f64 / unit as f64,
                prec = options.decimal_places
            ),
            None => n.to_string(),
        }
    } else if options.use_comma {
        n.to_formatted_string(&locale)
    } else {
        n.to_string()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KB * KB * KB {
        format!("{:.1} GB", b / (KB * KB * KB))
    } else if b >= KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Fast non-cryptographic hash, hex encoded. Used for cache file names.
pub fn fast_hash(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// Parses log timestamps. Accepts RFC 3339 and offset-less ISO strings (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, DATE_FORMAT).ok()
}

/// Calendar day of `ts` at the given offset.
pub fn local_date(ts: &DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

pub fn local_hour(ts: &DateTime<Utc>, offset: FixedOffset) -> usize {
    ts.with_timezone(&offset).hour() as usize
}

pub fn local_utc_offset() -> FixedOffset {
    chrono::Local::now().offset().fix()
}

/// `days` consecutive dates ending at `today`, oldest first.
pub fn trailing_dates(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_days(chrono::Days::new(back as u64)))
        .collect()
}

pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

pub fn percentage(numerator: f64, denominator: f64) -> f64 {
    round_to(ratio(numerator, denominator) * 100.0, 2)
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
