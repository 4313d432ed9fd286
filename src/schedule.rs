use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};

/// Canonical weekday used everywhere inside the daemon: Monday=1 .. Sunday=7
/// (ISO, same numbering as chrono's `number_from_monday`). Wire-level day
/// labels are converted exactly once, at the request boundary, via
/// [`parse_day_label`]; no other numbering exists past that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub fn number(self) -> u8 {
        match self {
            Weekday::Mon => 1,
            Weekday::Tue => 2,
            Weekday::Wed => 3,
            Weekday::Thu => 4,
            Weekday::Fri => 5,
            Weekday::Sat => 6,
            Weekday::Sun => 7,
        }
    }

    pub fn from_number(n: i64) -> Option<Weekday> {
        Some(match n {
            1 => Weekday::Mon,
            2 => Weekday::Tue,
            3 => Weekday::Wed,
            4 => Weekday::Thu,
            5 => Weekday::Fri,
            6 => Weekday::Sat,
            7 => Weekday::Sun,
            _ => return None,
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            Weekday::Mon => "Mon",
            Weekday::Tue => "Tue",
            Weekday::Wed => "Wed",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        }
    }
}

/// Map a wire-level day label to the canonical weekday.
///
/// Accepts the Vietnamese school-day names with and without diacritics
/// ("Thứ 2".."Thứ 7", "Chủ nhật", "thu 2", "chu nhat") plus English
/// three-letter abbreviations. Bare "thu" is Thursday; the Vietnamese forms
/// always carry a digit. Unknown labels return None and the request is
/// rejected with bad_params rather than the slot being silently dropped.
pub fn parse_day_label(raw: &str) -> Option<Weekday> {
    let key = raw.trim().to_lowercase();
    Some(match key.as_str() {
        "thứ 2" | "thu 2" | "mon" => Weekday::Mon,
        "thứ 3" | "thu 3" | "tue" => Weekday::Tue,
        "thứ 4" | "thu 4" | "wed" => Weekday::Wed,
        "thứ 5" | "thu 5" | "thu" => Weekday::Thu,
        "thứ 6" | "thu 6" | "fri" => Weekday::Fri,
        "thứ 7" | "thu 7" | "sat" => Weekday::Sat,
        "chủ nhật" | "chu nhat" | "sun" => Weekday::Sun,
        _ => return None,
    })
}

fn parse_hhmm(raw: &str) -> Option<u16> {
    let (h, m) = raw.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Parse a `"HH:MM-HH:MM"` label into (start, end) minutes since midnight.
/// Exactly two time tokens, numeric fields, and start strictly before end.
/// All times are naive wall-clock; there is no timezone handling.
pub fn parse_slot_label(raw: &str) -> Option<(u16, u16)> {
    let (a, b) = raw.split_once('-')?;
    let start = parse_hhmm(a)?;
    let end = parse_hhmm(b)?;
    if start >= end {
        return None;
    }
    Some((start, end))
}

pub fn fmt_minutes(min: u16) -> String {
    format!("{:02}:{:02}", min / 60, min % 60)
}

/// One recurring weekly occurrence of a class, not a single calendar event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySlot {
    pub day: Weekday,
    pub start_min: u16,
    pub end_min: u16,
}

impl WeeklySlot {
    pub fn time_range(&self) -> String {
        format!("{}-{}", fmt_minutes(self.start_min), fmt_minutes(self.end_min))
    }

    /// Half-open interval overlap on the same day. Touching boundaries
    /// (09:00-10:00 vs 10:00-11:00) do NOT overlap, so back-to-back
    /// scheduling stays legal.
    pub fn overlaps(&self, other: &WeeklySlot) -> bool {
        self.day == other.day
            && self.start_min < other.end_min
            && other.start_min < self.end_min
    }
}

/// A persisted slot together with the class it belongs to, for rendering
/// human-readable conflict lines.
#[derive(Debug, Clone)]
pub struct OwnedSlot {
    pub slot: WeeklySlot,
    pub class_id: String,
    pub class_name: String,
}

#[derive(Debug)]
pub struct Conflict<'a> {
    pub incoming: &'a WeeklySlot,
    pub existing: &'a OwnedSlot,
}

/// Every colliding (incoming, existing) pair, not just the first. The caller
/// turns the full list into one rejection so the client sees all collisions
/// at once.
pub fn find_conflicts<'a>(
    incoming: &'a [WeeklySlot],
    existing: &'a [OwnedSlot],
) -> Vec<Conflict<'a>> {
    let mut conflicts = Vec::new();
    for a in incoming {
        for b in existing {
            if a.overlaps(&b.slot) {
                conflicts.push(Conflict {
                    incoming: a,
                    existing: b,
                });
            }
        }
    }
    conflicts
}

/// Pairs of a request's own slots that collide with each other. A class's
/// slots must be internally non-overlapping before they are compared against
/// anything persisted.
pub fn find_internal_conflicts(slots: &[WeeklySlot]) -> Vec<(WeeklySlot, WeeklySlot)> {
    let mut conflicts = Vec::new();
    for (i, a) in slots.iter().enumerate() {
        for b in slots.iter().skip(i + 1) {
            if a.overlaps(b) {
                conflicts.push((*a, *b));
            }
        }
    }
    conflicts
}

pub fn conflict_report(conflicts: &[Conflict<'_>]) -> String {
    conflicts
        .iter()
        .map(|c| {
            format!(
                "• {} {} overlaps \"{}\" ({})",
                c.incoming.day.label(),
                c.incoming.time_range(),
                c.existing.class_name,
                c.existing.slot.time_range(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Project the first upcoming session of a recurring weekly schedule.
///
/// For each slot, take the next calendar date on-or-after `reference` that
/// falls on the slot's weekday, at the slot's start time; a candidate that
/// lands before `reference` rolls forward one week. The earliest candidate
/// wins. Returns None when there are no slots, in which case the
/// cancellation cutoff check is skipped entirely.
pub fn first_session_after(
    slots: &[WeeklySlot],
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let ref_dow = reference.weekday().number_from_monday() as i64;
    slots
        .iter()
        .filter_map(|s| {
            let days_ahead = (s.day.number() as i64 - ref_dow).rem_euclid(7);
            let time = NaiveTime::from_num_seconds_from_midnight_opt(
                u32::from(s.start_min) * 60,
                0,
            )?;
            let mut candidate = (reference.date() + Duration::days(days_ahead)).and_time(time);
            if candidate < reference {
                candidate += Duration::days(7);
            }
            Some(candidate)
        })
        .min()
}
