use chrono::{NaiveTime, Timelike};

use crate::profile::CommuteWindow;

pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open minute-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommuteSegment {
    pub start: u16,
    pub end: u16,
}

impl CommuteSegment {
    pub fn duration(&self) -> u16 {
        self.end - self.start
    }
}

/// Parses "HH:mm" into minutes since midnight. Returns `None` on anything
/// chrono will not accept as a 24-hour time.
pub fn minute_of_day(time: &str) -> Option<u16> {
    let parsed = NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()?;
    Some(((parsed.hour() * 60 + parsed.minute()) % u32::from(MINUTES_PER_DAY)) as u16)
}

/// Converts a commute window into one or two segments. A window with
/// `start > end` crosses midnight and is split at the day boundary; an
/// absent or malformed window yields no segments rather than an error.
pub fn normalize_window(window: Option<&CommuteWindow>) -> Vec<CommuteSegment> {
    let Some(window) = window else {
        return Vec::new();
    };
    let (Some(start), Some(end)) = (minute_of_day(&window.start), minute_of_day(&window.end))
    else {
        return Vec::new();
    };

    if start <= end {
        vec![CommuteSegment { start, end }]
    } else {
        vec![
            CommuteSegment {
                start,
                end: MINUTES_PER_DAY,
            },
            CommuteSegment { start: 0, end },
        ]
    }
}

pub fn total_duration(segments: &[CommuteSegment]) -> u32 {
    segments.iter().map(|s| u32::from(s.duration())).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn window(start: &str, end: &str) -> CommuteWindow {
        CommuteWindow {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    #[test]
    fn parses_minute_of_day() {
        assert_eq!(minute_of_day("00:00"), Some(0));
        assert_eq!(minute_of_day("08:30"), Some(510));
        assert_eq!(minute_of_day("23:59"), Some(1439));
        assert_eq!(minute_of_day(" 07:05 "), Some(425));
    }

    #[test]
    fn rejects_malformed_times() {
        assert_eq!(minute_of_day("24:00"), None);
        assert_eq!(minute_of_day("8h30"), None);
        assert_eq!(minute_of_day(""), None);
        assert_eq!(minute_of_day("12:60"), None);
    }

    #[test]
    fn daytime_window_is_one_segment() {
        let segments = normalize_window(Some(&window("08:00", "09:00")));
        assert_eq!(segments, vec![CommuteSegment { start: 480, end: 540 }]);
        assert_eq!(total_duration(&segments), 60);
    }

    #[test]
    fn overnight_window_splits_at_midnight() {
        let segments = normalize_window(Some(&window("22:00", "02:00")));
        assert_eq!(
            segments,
            vec![
                CommuteSegment {
                    start: 1320,
                    end: 1440
                },
                CommuteSegment { start: 0, end: 120 },
            ]
        );
        assert_eq!(total_duration(&segments), 240);
    }

    #[test]
    fn absent_window_yields_no_segments() {
        assert!(normalize_window(None).is_empty());
    }

    #[test]
    fn malformed_window_yields_no_segments() {
        assert!(normalize_window(Some(&window("25:00", "09:00"))).is_empty());
        assert!(normalize_window(Some(&window("08:00", "midnight"))).is_empty());
    }

    #[test]
    fn equal_start_and_end_is_an_empty_segment() {
        let segments = normalize_window(Some(&window("08:00", "08:00")));
        assert_eq!(segments.len(), 1);
        assert_eq!(total_duration(&segments), 0);
    }
}
