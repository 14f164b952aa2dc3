//! RRULE subset parser and window expansion for recurring calendar events.
//!
//! Supported parameters: `FREQ` (DAILY/WEEKLY/MONTHLY/YEARLY), `INTERVAL`,
//! `BYDAY`, `BYMONTHDAY`, `UNTIL` (UTC basic format, `YYYYMMDDTHHMMSSZ`),
//! `COUNT`. Anything else is an `InvalidRule` error; the calendar read path
//! logs and skips such parents instead of failing the whole listing.
//!
//! All times are UTC. Each occurrence carries the parent's duration.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid recurrence rule: {0}")]
pub struct InvalidRule(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub freq: Freq,
    pub interval: u32,
    pub by_day: Vec<Weekday>,
    pub by_month_day: Vec<u32>,
    pub until: Option<DateTime<Utc>>,
    pub count: Option<u32>,
}

impl Rule {
    /// Parse a compact `KEY=VALUE;...` rule string.
    pub fn parse(raw: &str) -> Result<Rule, InvalidRule> {
        let mut freq: Option<Freq> = None;
        let mut interval: u32 = 1;
        let mut by_day: Vec<Weekday> = Vec::new();
        let mut by_month_day: Vec<u32> = Vec::new();
        let mut until: Option<DateTime<Utc>> = None;
        let mut count: Option<u32> = None;

        for part in raw.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| InvalidRule(format!("missing '=' in {part:?}")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();

            match key.as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        "MONTHLY" => Freq::Monthly,
                        "YEARLY" => Freq::Yearly,
                        other => return Err(InvalidRule(format!("unsupported FREQ {other}"))),
                    });
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|v| *v >= 1)
                        .ok_or_else(|| InvalidRule(format!("bad INTERVAL {value:?}")))?;
                }
                "BYDAY" => {
                    for token in value.split(',') {
                        let day = match token.trim().to_ascii_uppercase().as_str() {
                            "MO" => Weekday::Mon,
                            "TU" => Weekday::Tue,
                            "WE" => Weekday::Wed,
                            "TH" => Weekday::Thu,
                            "FR" => Weekday::Fri,
                            "SA" => Weekday::Sat,
                            "SU" => Weekday::Sun,
                            other => {
                                return Err(InvalidRule(format!("bad BYDAY token {other:?}")))
                            }
                        };
                        if !by_day.contains(&day) {
                            by_day.push(day);
                        }
                    }
                }
                "BYMONTHDAY" => {
                    for token in value.split(',') {
                        let day = token
                            .trim()
                            .parse::<u32>()
                            .ok()
                            .filter(|d| (1..=31).contains(d))
                            .ok_or_else(|| {
                                InvalidRule(format!("bad BYMONTHDAY token {token:?}"))
                            })?;
                        if !by_month_day.contains(&day) {
                            by_month_day.push(day);
                        }
                    }
                    by_month_day.sort_unstable();
                }
                "UNTIL" => {
                    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
                        .map_err(|_| InvalidRule(format!("bad UNTIL {value:?}")))?;
                    until = Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
                }
                "COUNT" => {
                    count = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .filter(|v| *v >= 1)
                            .ok_or_else(|| InvalidRule(format!("bad COUNT {value:?}")))?,
                    );
                }
                other => return Err(InvalidRule(format!("unknown parameter {other}"))),
            }
        }

        let freq = freq.ok_or_else(|| InvalidRule("missing FREQ".to_string()))?;
        Ok(Rule {
            freq,
            interval,
            by_day,
            by_month_day,
            until,
            count,
        })
    }

    /// Expand occurrences of a recurring parent into `[window_start,
    /// window_end)`. The first candidate is `parent_start`; starts are
    /// strictly ascending with no duplicates; each occurrence keeps the
    /// parent's duration. `COUNT` is consumed from the beginning of the
    /// series, so occurrences before the window still count against it.
    /// When both `UNTIL` and `COUNT` are present, whichever bound is hit
    /// first terminates the series.
    pub fn expand(
        &self,
        parent_start: DateTime<Utc>,
        parent_end: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Occurrences {
        Occurrences {
            rule: self.clone(),
            parent_start,
            duration: parent_end - parent_start,
            window_start,
            window_end,
            period: 0,
            emitted: 0,
            last_start: None,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

/// Lazy occurrence stream produced by [`Rule::expand`].
pub struct Occurrences {
    rule: Rule,
    parent_start: DateTime<Utc>,
    duration: Duration,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    period: u64,
    emitted: u32,
    last_start: Option<DateTime<Utc>>,
    pending: VecDeque<DateTime<Utc>>,
    done: bool,
}

impl Occurrences {
    fn bound(&self) -> DateTime<Utc> {
        // UNTIL is inclusive; the window end is exclusive.
        match self.rule.until {
            Some(until) => until.min(self.window_end - Duration::milliseconds(1)),
            None => self.window_end - Duration::milliseconds(1),
        }
    }

    fn matches_filters(&self, start: DateTime<Utc>) -> bool {
        let by_day_ok = match self.rule.freq {
            // For WEEKLY, BYDAY expands within the period instead.
            Freq::Weekly => true,
            _ => self.rule.by_day.is_empty() || self.rule.by_day.contains(&start.weekday()),
        };
        let by_month_day_ok = match self.rule.freq {
            // For MONTHLY, BYMONTHDAY expands within the period instead.
            Freq::Monthly => true,
            _ => {
                self.rule.by_month_day.is_empty()
                    || self.rule.by_month_day.contains(&start.day())
            }
        };
        by_day_ok && by_month_day_ok
    }

    /// Earliest instant any candidate of period `k` can take; monotonically
    /// increasing in `k`, which makes the outer loop total. Unlike the
    /// anchor, the floor exists even when the nominal day does not (Feb 30),
    /// so short months never end the series early. `None` only on overflow.
    fn period_floor(&self, k: u64) -> Option<DateTime<Utc>> {
        let step = k
            .checked_mul(self.rule.interval as u64)
            .and_then(|v| i64::try_from(v).ok())?;
        let time = self.parent_start.time();
        match self.rule.freq {
            Freq::Daily => self
                .parent_start
                .checked_add_signed(Duration::days(step)),
            Freq::Weekly => {
                let anchor = self
                    .parent_start
                    .checked_add_signed(Duration::days(step * 7))?;
                let back = anchor.weekday().num_days_from_monday() as i64;
                Some(anchor - Duration::days(back))
            }
            Freq::Monthly => {
                let months0 =
                    (self.parent_start.year() as i64 * 12 + self.parent_start.month0() as i64)
                        + step;
                let year = i32::try_from(months0.div_euclid(12)).ok()?;
                let month0 = months0.rem_euclid(12) as u32;
                let first = NaiveDate::from_ymd_opt(year, month0 + 1, 1)?;
                Some(DateTime::<Utc>::from_naive_utc_and_offset(
                    first.and_time(time),
                    Utc,
                ))
            }
            Freq::Yearly => {
                let year = i32::try_from(self.parent_start.year() as i64 + step).ok()?;
                let first = NaiveDate::from_ymd_opt(year, 1, 1)?;
                Some(DateTime::<Utc>::from_naive_utc_and_offset(
                    first.and_time(time),
                    Utc,
                ))
            }
        }
    }

    /// Nominal start of period `k`, computed from the parent anchor rather
    /// than by cumulative addition so monthly arithmetic cannot drift.
    /// `None` when the nominal day does not exist (Jan 31 + 1 month).
    fn period_anchor(&self, k: u64) -> Option<DateTime<Utc>> {
        let step = k
            .checked_mul(self.rule.interval as u64)
            .and_then(|v| i64::try_from(v).ok())?;
        match self.rule.freq {
            Freq::Daily => Some(self.parent_start + Duration::days(step)),
            Freq::Weekly => Some(self.parent_start + Duration::days(step * 7)),
            Freq::Monthly => {
                let months0 =
                    (self.parent_start.year() as i64 * 12 + self.parent_start.month0() as i64)
                        + step;
                let year = months0.div_euclid(12) as i32;
                let month0 = months0.rem_euclid(12) as u32;
                let date =
                    NaiveDate::from_ymd_opt(year, month0 + 1, self.parent_start.day())?;
                Some(DateTime::<Utc>::from_naive_utc_and_offset(
                    date.and_time(self.parent_start.time()),
                    Utc,
                ))
            }
            Freq::Yearly => {
                let year = self.parent_start.year() as i64 + step;
                let date = NaiveDate::from_ymd_opt(
                    i32::try_from(year).ok()?,
                    self.parent_start.month(),
                    self.parent_start.day(),
                )?;
                Some(DateTime::<Utc>::from_naive_utc_and_offset(
                    date.and_time(self.parent_start.time()),
                    Utc,
                ))
            }
        }
    }

    /// Candidates of period `k`, ascending, `>= parent_start`, pre-filtered
    /// by BYDAY/BYMONTHDAY where those act as filters.
    fn period_candidates(&self, k: u64) -> Vec<DateTime<Utc>> {
        let Some(anchor) = self.period_anchor(k) else {
            return Vec::new();
        };
        let time = self.parent_start.time();

        let mut out: Vec<DateTime<Utc>> = match self.rule.freq {
            Freq::Daily | Freq::Yearly => vec![anchor],
            Freq::Weekly => {
                if self.rule.by_day.is_empty() {
                    vec![anchor]
                } else {
                    let week_start = anchor
                        - Duration::days(anchor.weekday().num_days_from_monday() as i64);
                    (0..7)
                        .map(|offset| week_start + Duration::days(offset))
                        .filter(|day| self.rule.by_day.contains(&day.weekday()))
                        .collect()
                }
            }
            Freq::Monthly => {
                if self.rule.by_month_day.is_empty() {
                    vec![anchor]
                } else {
                    self.rule
                        .by_month_day
                        .iter()
                        .filter_map(|day| {
                            NaiveDate::from_ymd_opt(anchor.year(), anchor.month(), *day)
                        })
                        .map(|date| {
                            DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(time), Utc)
                        })
                        .filter(|start| {
                            self.rule.by_day.is_empty()
                                || self.rule.by_day.contains(&start.weekday())
                        })
                        .collect()
                }
            }
        };

        out.retain(|start| *start >= self.parent_start && self.matches_filters(*start));
        out.sort_unstable();
        out
    }
}

impl Iterator for Occurrences {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let bound = self.bound();

        loop {
            if let Some(count) = self.rule.count {
                if self.emitted >= count {
                    self.done = true;
                    return None;
                }
            }

            let start = match self.pending.pop_front() {
                Some(start) => start,
                None => {
                    // Refill from the next period whose floor is still in range.
                    loop {
                        let k = self.period;
                        self.period += 1;
                        match self.period_floor(k) {
                            Some(floor) if floor > bound => {
                                self.done = true;
                                return None;
                            }
                            Some(_) => {
                                let candidates = self.period_candidates(k);
                                if !candidates.is_empty() {
                                    self.pending.extend(candidates);
                                    break;
                                }
                                // Period produced nothing (e.g. short month);
                                // the floor check above keeps this loop finite.
                            }
                            None => {
                                self.done = true;
                                return None;
                            }
                        }
                    }
                    continue;
                }
            };

            // The very first candidate is always parent_start; a period
            // expansion may regenerate it, so dedupe on the last start.
            if self.last_start.is_some_and(|prev| start <= prev) {
                continue;
            }
            if start > bound {
                self.done = true;
                return None;
            }

            self.last_start = Some(start);
            self.emitted += 1;
            if start < self.window_start {
                // Still consumes COUNT, but falls outside the window.
                continue;
            }
            return Some((start, start + self.duration));
        }
    }
}

/// One reconciled entry of an expanded listing.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciled<'a, E> {
    /// A virtual occurrence rendered from the parent's fields.
    Occurrence {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// A modified occurrence; `original_start` stays the identity key.
    Overridden {
        original_start: DateTime<Utc>,
        exception: &'a E,
    },
}

/// Apply per-occurrence exceptions, keyed by original start. Cancelled
/// occurrences disappear; modified ones surface the exception's fields.
pub fn reconcile<'a, E, I, F>(
    occurrences: I,
    exceptions: &'a HashMap<DateTime<Utc>, E>,
    is_cancelled: F,
) -> Vec<Reconciled<'a, E>>
where
    I: Iterator<Item = (DateTime<Utc>, DateTime<Utc>)>,
    F: Fn(&E) -> bool,
{
    let mut out = Vec::new();
    for (start, end) in occurrences {
        match exceptions.get(&start) {
            None => out.push(Reconciled::Occurrence { start, end }),
            Some(exception) if is_cancelled(exception) => {}
            Some(exception) => out.push(Reconciled::Overridden {
                original_start: start,
                exception,
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn starts(rule: &str, start: DateTime<Utc>, a: DateTime<Utc>, b: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        Rule::parse(rule)
            .unwrap()
            .expand(start, start + Duration::hours(1), a, b)
            .map(|(s, _)| s)
            .collect()
    }

    #[test]
    fn parses_full_rule() {
        let rule = Rule::parse("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE;UNTIL=20250601T000000Z;COUNT=9")
            .unwrap();
        assert_eq!(rule.freq, Freq::Weekly);
        assert_eq!(rule.interval, 2);
        assert_eq!(rule.by_day, vec![Weekday::Mon, Weekday::Wed]);
        assert_eq!(rule.until, Some(utc(2025, 6, 1, 0, 0)));
        assert_eq!(rule.count, Some(9));
    }

    #[test]
    fn rejects_unknown_parameter() {
        let err = Rule::parse("FREQ=DAILY;BYSETPOS=1").unwrap_err();
        assert!(err.0.contains("unknown parameter"));
        assert!(Rule::parse("INTERVAL=2").is_err()); // missing FREQ
        assert!(Rule::parse("FREQ=HOURLY").is_err());
        assert!(Rule::parse("FREQ=DAILY;INTERVAL=0").is_err());
        assert!(Rule::parse("FREQ=DAILY;BYDAY=XX").is_err());
        assert!(Rule::parse("FREQ=DAILY;UNTIL=20250101T000000").is_err());
    }

    #[test]
    fn daily_count_bounds_series() {
        let got = starts(
            "FREQ=DAILY;COUNT=5",
            utc(2025, 1, 1, 9, 0),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 1, 6, 0, 0),
        );
        assert_eq!(
            got,
            vec![
                utc(2025, 1, 1, 9, 0),
                utc(2025, 1, 2, 9, 0),
                utc(2025, 1, 3, 9, 0),
                utc(2025, 1, 4, 9, 0),
                utc(2025, 1, 5, 9, 0),
            ]
        );
    }

    #[test]
    fn count_is_consumed_before_window() {
        let got = starts(
            "FREQ=DAILY;COUNT=5",
            utc(2025, 1, 1, 9, 0),
            utc(2025, 1, 4, 0, 0),
            utc(2025, 1, 20, 0, 0),
        );
        assert_eq!(got, vec![utc(2025, 1, 4, 9, 0), utc(2025, 1, 5, 9, 0)]);
    }

    #[test]
    fn until_and_count_use_earlier_bound() {
        // UNTIL cuts the series before COUNT would.
        let got = starts(
            "FREQ=DAILY;COUNT=10;UNTIL=20250103T090000Z",
            utc(2025, 1, 1, 9, 0),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 2, 1, 0, 0),
        );
        assert_eq!(got.len(), 3); // Jan 1, 2, 3 (UNTIL inclusive)
        // COUNT cuts before UNTIL.
        let got = starts(
            "FREQ=DAILY;COUNT=2;UNTIL=20250110T000000Z",
            utc(2025, 1, 1, 9, 0),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 2, 1, 0, 0),
        );
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn weekly_byday_expands_within_week() {
        // Parent on a Wednesday; MO,WE,FR weekly.
        let got = starts(
            "FREQ=WEEKLY;BYDAY=MO,WE,FR",
            utc(2025, 1, 1, 9, 0), // Wed
            utc(2025, 1, 1, 0, 0),
            utc(2025, 1, 11, 0, 0),
        );
        assert_eq!(
            got,
            vec![
                utc(2025, 1, 1, 9, 0),  // Wed
                utc(2025, 1, 3, 9, 0),  // Fri
                utc(2025, 1, 6, 9, 0),  // Mon
                utc(2025, 1, 8, 9, 0),  // Wed
                utc(2025, 1, 10, 9, 0), // Fri
            ]
        );
    }

    #[test]
    fn weekly_interval_skips_weeks() {
        let got = starts(
            "FREQ=WEEKLY;INTERVAL=2",
            utc(2025, 1, 6, 9, 0), // Mon
            utc(2025, 1, 1, 0, 0),
            utc(2025, 2, 10, 0, 0),
        );
        assert_eq!(
            got,
            vec![
                utc(2025, 1, 6, 9, 0),
                utc(2025, 1, 20, 9, 0),
                utc(2025, 2, 3, 9, 0),
            ]
        );
    }

    #[test]
    fn monthly_bymonthday_expands_within_month() {
        let got = starts(
            "FREQ=MONTHLY;BYMONTHDAY=1,15",
            utc(2025, 1, 1, 8, 0),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 3, 1, 0, 0),
        );
        assert_eq!(
            got,
            vec![
                utc(2025, 1, 1, 8, 0),
                utc(2025, 1, 15, 8, 0),
                utc(2025, 2, 1, 8, 0),
                utc(2025, 2, 15, 8, 0),
            ]
        );
    }

    #[test]
    fn monthly_day_31_skips_short_months() {
        let got = starts(
            "FREQ=MONTHLY",
            utc(2025, 1, 31, 10, 0),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 6, 1, 0, 0),
        );
        assert_eq!(
            got,
            vec![
                utc(2025, 1, 31, 10, 0),
                utc(2025, 3, 31, 10, 0),
                utc(2025, 5, 31, 10, 0),
            ]
        );
    }

    #[test]
    fn yearly_feb_29_only_in_leap_years() {
        let got = starts(
            "FREQ=YEARLY",
            utc(2024, 2, 29, 12, 0),
            utc(2024, 1, 1, 0, 0),
            utc(2029, 1, 1, 0, 0),
        );
        assert_eq!(got, vec![utc(2024, 2, 29, 12, 0), utc(2028, 2, 29, 12, 0)]);
    }

    #[test]
    fn starts_are_strictly_ascending_and_within_window() {
        let window_start = utc(2025, 1, 5, 0, 0);
        let window_end = utc(2025, 4, 1, 0, 0);
        let got = starts(
            "FREQ=WEEKLY;BYDAY=MO,TU,WE,TH,FR,SA,SU",
            utc(2025, 1, 1, 9, 0),
            window_start,
            window_end,
        );
        assert!(!got.is_empty());
        for pair in got.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for start in &got {
            assert!(*start >= window_start && *start < window_end);
        }
    }

    #[test]
    fn duration_is_preserved() {
        let rule = Rule::parse("FREQ=DAILY;COUNT=3").unwrap();
        let start = utc(2025, 1, 1, 22, 30);
        let end = start + Duration::hours(3); // crosses midnight
        for (s, e) in rule.expand(start, end, utc(2025, 1, 1, 0, 0), utc(2025, 2, 1, 0, 0)) {
            assert_eq!(e - s, Duration::hours(3));
        }
    }

    #[derive(Debug, PartialEq)]
    struct Exc {
        cancelled: bool,
        title: &'static str,
    }

    #[test]
    fn reconcile_drops_cancelled_and_keeps_overrides() {
        let rule = Rule::parse("FREQ=DAILY;COUNT=5").unwrap();
        let start = utc(2025, 1, 1, 9, 0);
        let occurrences = rule.expand(
            start,
            start + Duration::hours(1),
            utc(2025, 1, 1, 0, 0),
            utc(2025, 1, 6, 0, 0),
        );

        let mut exceptions = HashMap::new();
        exceptions.insert(
            utc(2025, 1, 3, 9, 0),
            Exc {
                cancelled: true,
                title: "",
            },
        );
        exceptions.insert(
            utc(2025, 1, 4, 9, 0),
            Exc {
                cancelled: false,
                title: "moved",
            },
        );

        let got = reconcile(occurrences, &exceptions, |e| e.cancelled);
        assert_eq!(got.len(), 4);
        assert!(matches!(
            got[0],
            Reconciled::Occurrence { start, .. } if start == utc(2025, 1, 1, 9, 0)
        ));
        assert!(matches!(
            got[2],
            Reconciled::Overridden { original_start, exception }
                if original_start == utc(2025, 1, 4, 9, 0) && exception.title == "moved"
        ));
        assert!(matches!(
            got[3],
            Reconciled::Occurrence { start, .. } if start == utc(2025, 1, 5, 9, 0)
        ));
    }
}
