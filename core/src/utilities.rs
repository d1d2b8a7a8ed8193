//! Utility functions for parsing durations, sizes, command lines and
//! variable references found in service definitions

use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Poll interval used when a service does not configure one
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Smallest poll interval a service may use
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;

static DURATION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(\D+)").expect("valid duration token regex"));

static VARIABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^{}]+)\}").expect("valid variable regex"));

/// Parse a poll interval expression into milliseconds.
///
/// The expression is a sequence of `<number><unit>` tokens that are summed,
/// e.g. `"1m30s"`, `"2 days"` or `"1_500ms"`. Whitespace and underscores are
/// ignored and units are case-insensitive. Unknown units count as
/// milliseconds. When no token is found the digits of the expression are
/// taken as milliseconds. The result is never below one second.
///
/// # Examples
///
/// ```
/// use devdash_core::utilities::parse_poll_interval;
///
/// assert_eq!(parse_poll_interval(Some("12s34ms")), 12_034);
/// assert_eq!(parse_poll_interval(Some("2500")), 2_500);
/// assert_eq!(parse_poll_interval(Some("10")), 1_000);
/// assert_eq!(parse_poll_interval(None), 10_000);
/// ```
pub fn parse_poll_interval(text: Option<&str>) -> u64 {
    let text: String = text
        .unwrap_or("10000")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_lowercase();

    let mut total: u64 = 0;
    for caps in DURATION_TOKEN.captures_iter(&text) {
        let value: u64 = caps[1].parse().unwrap_or(u64::MAX);
        total = total.saturating_add(value.saturating_mul(unit_ms(&caps[2])));
    }
    if total == 0 {
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        total = digits.parse().unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    }
    total.max(MIN_POLL_INTERVAL_MS)
}

fn unit_ms(unit: &str) -> u64 {
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => 1,
    }
}

/// Format milliseconds as a duration expression accepted by
/// [`parse_poll_interval`], e.g. `"2d3s"`.
pub fn format_duration_ms(ms: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
        (1, "ms"),
    ];
    if ms == 0 {
        return "0ms".to_string();
    }
    let mut rest = ms;
    let mut out = String::new();
    for (size, unit) in UNITS {
        let count = rest / size;
        if count > 0 {
            out.push_str(&count.to_string());
            out.push_str(unit);
            rest %= size;
        }
    }
    out
}

/// Parse a size like `"5M"`, `"512k"` or `"1_000"` into bytes.
///
/// Returns `None` when the text does not start with a number.
pub fn parse_size(text: &str) -> Option<u64> {
    let text: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let value: u64 = text[..split].parse().ok()?;
    let exponent = text[split..]
        .chars()
        .next()
        .and_then(|c| "bkmgtpe".find(c.to_ascii_lowercase()))
        .unwrap_or(0);
    Some(value.saturating_mul(1024u64.saturating_pow(exponent as u32)))
}

/// Compare two strings treating runs of digits as numbers, so that
/// `app-1.10.jar` sorts after `app-1.9.jar`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_number(&mut left);
                let rn = take_number(&mut right);
                let ord = ln
                    .trim_start_matches('0')
                    .len()
                    .cmp(&rn.trim_start_matches('0').len())
                    .then_with(|| ln.trim_start_matches('0').cmp(rn.trim_start_matches('0')));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}

/// Split a command line into arguments on whitespace. Text between matching
/// single, double or back quotes is kept together, without the quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_part = false;
    let mut quote: Option<char> = None;

    for c in line.trim().chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if matches!(c, '\'' | '"' | '`') => {
                quote = Some(c);
                in_part = true;
            }
            None if c.is_whitespace() => {
                if in_part {
                    parts.push(std::mem::take(&mut current));
                    in_part = false;
                }
            }
            None => {
                current.push(c);
                in_part = true;
            }
        }
    }
    if in_part {
        parts.push(current);
    }
    parts
}

/// Replace `${name}` references with values from `vars`, falling back to
/// environment variables. Unknown references are left as they are.
/// Substitution is repeated so values may refer to other variables.
pub fn replace_variables(text: &str, vars: &BTreeMap<String, String>) -> String {
    if !text.contains("${") {
        return text.to_string();
    }
    let mut current = text.to_string();
    for _ in 0..100 {
        let next = VARIABLE_REF
            .replace_all(&current, |caps: &regex::Captures<'_>| {
                let name = caps[1].trim();
                vars.get(name)
                    .cloned()
                    .or_else(|| std::env::var(name).ok())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        if next == current {
            break;
        }
        current = next;
    }
    current
}
