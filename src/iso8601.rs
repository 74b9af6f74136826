//! Minimal ISO 8601 duration validation for the `interval` accessor
//! (`spec.md` §4.5: "ISO 8601 duration (round-trip must match)").
//!
//! There is no ambient duration type in the dependency stack for this
//! format (unlike date/time/timestamp, which `chrono` parses directly), so
//! this module hand-rolls a parser/serializer pair and accepts a string only
//! when serializing what it parsed reproduces the input exactly.

#[derive(Debug, Default, PartialEq)]
struct Components {
    years: u64,
    months: u64,
    days: u64,
    hours: u64,
    minutes: u64,
    seconds: f64,
    has_time: bool,
}

pub fn is_valid_duration(s: &str) -> bool {
    if let Some(weeks) = s.strip_prefix('P').and_then(|r| r.strip_suffix('W')) {
        return is_canonical_digits(weeks);
    }
    parse(s).is_some_and(|c| format(&c) == s)
}

fn is_canonical_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) && !(s.len() > 1 && s.starts_with('0'))
}

fn parse(s: &str) -> Option<Components> {
    let rest = s.strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut c = Components::default();
    let mut any = false;
    let mut cur = date_part;
    for unit in ['Y', 'M', 'D'] {
        if let Some((digits, remainder)) = take_component(cur, unit) {
            any = true;
            let n: u64 = digits.parse().ok()?;
            match unit {
                'Y' => c.years = n,
                'M' => c.months = n,
                'D' => c.days = n,
                _ => unreachable!(),
            }
            cur = remainder;
        }
    }
    if !cur.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        c.has_time = true;
        let mut cur = time_part;
        if let Some((digits, remainder)) = take_component(cur, 'H') {
            any = true;
            c.hours = digits.parse().ok()?;
            cur = remainder;
        }
        if let Some((digits, remainder)) = take_component(cur, 'M') {
            any = true;
            c.minutes = digits.parse().ok()?;
            cur = remainder;
        }
        if let Some((digits, remainder)) = take_component_float(cur, 'S') {
            any = true;
            c.seconds = digits.parse().ok()?;
            cur = remainder;
        }
        if !cur.is_empty() {
            return None;
        }
    }

    if !any {
        return None;
    }
    Some(c)
}

fn take_component<'a>(s: &'a str, unit: char) -> Option<(&'a str, &'a str)> {
    let end = s.find(unit)?;
    let digits = &s[..end];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    Some((digits, &s[end + unit.len_utf8()..]))
}

fn take_component_float<'a>(s: &'a str, unit: char) -> Option<(&'a str, &'a str)> {
    let end = s.find(unit)?;
    let digits = &s[..end];
    if digits.is_empty() {
        return None;
    }
    let valid = digits
        .split_once('.')
        .map(|(whole, frac)| {
            !whole.is_empty()
                && whole.chars().all(|c| c.is_ascii_digit())
                && !frac.is_empty()
                && frac.chars().all(|c| c.is_ascii_digit())
        })
        .unwrap_or_else(|| digits.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return None;
    }
    Some((digits, &s[end + unit.len_utf8()..]))
}

fn format(c: &Components) -> String {
    let mut out = String::from("P");
    if c.years > 0 {
        out.push_str(&format!("{}Y", c.years));
    }
    if c.months > 0 {
        out.push_str(&format!("{}M", c.months));
    }
    if c.days > 0 {
        out.push_str(&format!("{}D", c.days));
    }
    if c.has_time {
        out.push('T');
        if c.hours > 0 {
            out.push_str(&format!("{}H", c.hours));
        }
        if c.minutes > 0 {
            out.push_str(&format!("{}M", c.minutes));
        }
        if c.seconds > 0.0 {
            if c.seconds.fract() == 0.0 {
                out.push_str(&format!("{}S", c.seconds as u64));
            } else {
                out.push_str(&format!("{}S", c.seconds));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_duration() {
        assert!(is_valid_duration("P1Y2M3DT4H5M6S"));
    }

    #[test]
    fn accepts_weeks_form() {
        assert!(is_valid_duration("P2W"));
    }

    #[test]
    fn rejects_non_canonical_leading_zero() {
        assert!(!is_valid_duration("P01Y"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid_duration("not a duration"));
        assert!(!is_valid_duration("P"));
    }

    #[test]
    fn accepts_fractional_seconds() {
        assert!(is_valid_duration("PT1.5S"));
    }
}
