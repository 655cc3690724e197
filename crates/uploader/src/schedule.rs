//! Publish-time scheduling.
//!
//! A channel publishes at fixed times of day (slots). Each item gets the
//! first slot strictly after the previous item's time; once a day's slots are
//! used up the schedule moves `1 + day_gap` days ahead.

use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeDelta, TimeZone};

/// Slot used when none of the configured slots parse.
pub fn default_slot() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Parses one `HH:MM` slot.
pub fn parse_slot(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Daily slots plus the gap inserted between days.
///
/// Slots are kept sorted ascending and de-duplicated, and are never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    slots: Vec<NaiveTime>,
    day_gap: u32,
}

impl Cadence {
    pub fn new(mut slots: Vec<NaiveTime>, day_gap: u32) -> Self {
        slots.sort();
        slots.dedup();
        if slots.is_empty() {
            slots.push(default_slot());
        }
        Self { slots, day_gap }
    }

    /// Builds a cadence from `HH:MM` strings; unparseable entries are dropped.
    pub fn from_entries<I, S>(entries: I, day_gap: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slots = entries
            .into_iter()
            .filter_map(|s| parse_slot(s.as_ref()))
            .collect();
        Self::new(slots, day_gap)
    }

    /// Slots in ascending order.
    pub fn slots(&self) -> &[NaiveTime] {
        &self.slots
    }

    pub fn day_gap(&self) -> u32 {
        self.day_gap
    }
}

fn at_slot<Tz: TimeZone>(tz: &Tz, date: NaiveDate, slot: NaiveTime) -> Option<DateTime<Tz>> {
    // Slots falling into a DST gap do not exist that day
    tz.from_local_datetime(&date.and_time(slot)).earliest()
}

/// Next publish instant strictly after `base`.
pub fn next_publish_time_after<Tz: TimeZone>(base: &DateTime<Tz>, cadence: &Cadence) -> DateTime<Tz> {
    let tz = base.timezone();
    let date = base.date_naive();

    for slot in cadence.slots() {
        if let Some(candidate) = at_slot(&tz, date, *slot) {
            if candidate > *base {
                return candidate;
            }
        }
    }

    let advance = 1 + u64::from(cadence.day_gap());
    let mut day = date.checked_add_days(Days::new(advance));
    // A few extra days cover slots swallowed by a DST transition
    for _ in 0..8 {
        let Some(current) = day else { break };
        for slot in cadence.slots() {
            if let Some(candidate) = at_slot(&tz, current, *slot) {
                if candidate > *base {
                    return candidate;
                }
            }
        }
        day = current.succ_opt();
    }

    base.clone() + TimeDelta::minutes(1)
}

/// Next publish instant relative to a schedule cursor.
///
/// Uses `cursor` as the base when set, otherwise `now`. The result is always
/// strictly later than the base.
pub fn next_publish_time<Tz: TimeZone>(
    cursor: Option<&DateTime<Tz>>,
    cadence: &Cadence,
    now: DateTime<Tz>,
) -> DateTime<Tz> {
    match cursor {
        Some(last) => next_publish_time_after(last, cadence),
        None => next_publish_time_after(&now, cadence),
    }
}

/// The most recently assigned publish instant of one channel run.
///
/// Starts unset and only ever moves forward.
#[derive(Debug, Clone)]
pub struct ScheduleCursor<Tz: TimeZone = Local> {
    last: Option<DateTime<Tz>>,
}

impl<Tz: TimeZone> Default for ScheduleCursor<Tz> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<Tz: TimeZone> ScheduleCursor<Tz> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&DateTime<Tz>> {
        self.last.as_ref()
    }

    /// Time the next item would receive; does not move the cursor.
    pub fn peek(&self, cadence: &Cadence, now: DateTime<Tz>) -> DateTime<Tz> {
        next_publish_time(self.last.as_ref(), cadence, now)
    }

    /// Records an assigned time. Earlier times are ignored.
    pub fn commit(&mut self, assigned: DateTime<Tz>) {
        let advances = match &self.last {
            Some(last) => assigned > *last,
            None => true,
        };
        if advances {
            self.last = Some(assigned);
        }
    }

    /// Computes the next time and commits it.
    pub fn advance(&mut self, cadence: &Cadence, now: DateTime<Tz>) -> DateTime<Tz> {
        let next = self.peek(cadence, now);
        self.commit(next.clone());
        next
    }
}
