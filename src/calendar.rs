//! Calendar scheduling engine.
//!
//! Keeps the calendar slots reported by each device and finds free time in
//! the 24 hour window starting at the device clock. All lookups that find
//! nothing return `None`.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::protocol::{
    from_device_millis, to_device_millis, CalendarProgram, FAVORITE_NONE, START_MODE_READY_AT,
};
use crate::state::DeviceState;
use crate::types::DeviceId;

/// Bath length the scheduler aims for, in minutes
pub const PREFERRED_BATH_MINUTES: i64 = 180;

/// First user programmable date slot
pub const FIRST_DATE_PROGRAM: u8 = 1;

/// Last user programmable date slot
pub const LAST_DATE_PROGRAM: u8 = 21;

/// Number of slots a fully reported calendar holds
pub const CALENDAR_SLOTS: usize = 22;

/// Check whether an index addresses a date program
#[must_use]
pub const fn is_date_program(index: u8) -> bool {
    index >= FIRST_DATE_PROGRAM && index <= LAST_DATE_PROGRAM
}

/// A calendar slot of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEntry {
    /// Slot index
    pub index: u8,
    /// Slot holds a program
    pub valid: bool,
    /// Start of the program
    pub activation_time: DateTime<Utc>,
    /// Activation plus bath time
    pub end_time: DateTime<Utc>,
    /// Bath time in minutes
    pub bath_time: u16,
    /// Target temperature
    pub temperature_set_point: i32,
    /// Target humidity
    pub humidity_set_point: i32,
    /// Weekday program
    pub weekday: bool,
    /// Start mode code
    pub start_mode: u8,
    /// Start in standby
    pub standby: bool,
    /// Linked favorite
    pub favorite: Option<u8>,
}

impl CalendarEntry {
    /// Parse a wire program; a missing activation time maps to the device epoch
    ///
    /// Returns `None` when the activation time or the end time cannot be
    /// represented.
    #[must_use]
    pub fn from_program(program: &CalendarProgram) -> Option<Self> {
        let activation_time = from_device_millis(program.activation_time.unwrap_or(0))?;
        let end_time = activation_time
            .checked_add_signed(Duration::minutes(i64::from(program.bath_time)))?;
        Some(Self {
            index: program.index,
            valid: program.valid,
            activation_time,
            end_time,
            bath_time: program.bath_time,
            temperature_set_point: program.temperature_set_point,
            humidity_set_point: program.humidity_set_point,
            weekday: program.weekday,
            start_mode: program.start_mode,
            standby: program.standby,
            favorite: (program.favorite != FAVORITE_NONE).then_some(program.favorite),
        })
    }

    /// Encode for a calendar post
    #[must_use]
    pub fn to_program(&self) -> CalendarProgram {
        CalendarProgram {
            index: self.index,
            valid: self.valid,
            activation_time: Some(to_device_millis(self.activation_time)),
            bath_time: self.bath_time,
            temperature_set_point: self.temperature_set_point,
            humidity_set_point: self.humidity_set_point,
            weekday: self.weekday,
            start_mode: self.start_mode,
            standby: self.standby,
            favorite: self.favorite.unwrap_or(FAVORITE_NONE),
        }
    }

    /// End time, taking the bath time of a linked favorite when it is known
    #[must_use]
    pub fn effective_end(&self, state: &DeviceState) -> DateTime<Utc> {
        self.favorite
            .and_then(|index| state.favorite(index))
            .and_then(|favorite| {
                self.activation_time
                    .checked_add_signed(Duration::minutes(i64::from(favorite.bath_time)))
            })
            .unwrap_or(self.end_time)
    }
}

/// Stored entry inside the current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry<'a> {
    /// The stored entry
    pub entry: &'a CalendarEntry,
    /// End used for scheduling
    pub effective_end: DateTime<Utc>,
}

/// Free interval inside the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeGap {
    /// Start of the gap
    pub start: DateTime<Utc>,
    /// End of the gap
    pub end: DateTime<Utc>,
    /// Length in whole minutes
    pub minutes: i64,
}

impl TimeGap {
    fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            minutes: (end - start).num_minutes(),
        }
    }

    fn span(&self) -> Duration {
        self.end - self.start
    }
}

/// Entry being edited or created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingEntry {
    /// The entry
    pub entry: CalendarEntry,
    /// Synthesized rather than copied from a stored slot
    pub freshly_created: bool,
}

/// Per-device calendar lists and scheduling
#[derive(Debug)]
pub struct CalendarEngine {
    entries: HashMap<DeviceId, Vec<Option<CalendarEntry>>>,
    working: HashMap<DeviceId, WorkingEntry>,
    noon_offset: FixedOffset,
}

impl CalendarEngine {
    /// Create an engine placing "noon" in the given offset
    #[must_use]
    pub fn new(noon_offset: FixedOffset) -> Self {
        Self {
            entries: HashMap::new(),
            working: HashMap::new(),
            noon_offset,
        }
    }

    /// Stored slots of a device; the list is created empty on first access
    pub fn entries(&mut self, device_id: DeviceId) -> &[Option<CalendarEntry>] {
        self.entries.entry(device_id).or_default()
    }

    /// Stored entry at a slot
    #[must_use]
    pub fn entry(&self, device_id: DeviceId, index: u8) -> Option<&CalendarEntry> {
        self.entries
            .get(&device_id)?
            .get(usize::from(index))?
            .as_ref()
    }

    /// Store an entry at its slot, growing the list as needed
    pub fn store_entry(&mut self, device_id: DeviceId, entry: CalendarEntry) {
        let slots = self.entries.entry(device_id).or_default();
        let index = usize::from(entry.index);
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(entry);
    }

    /// Valid date programs intersecting `[now, now + 24h)`, by activation
    #[must_use]
    pub fn window_entries<'a>(
        &'a self,
        device_id: DeviceId,
        state: &DeviceState,
    ) -> Vec<WindowEntry<'a>> {
        let now = state.device_time;
        let window_end = now + Duration::hours(24);

        let mut list: Vec<WindowEntry<'a>> = self
            .entries
            .get(&device_id)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| entry.valid && is_date_program(entry.index))
            .map(|entry| WindowEntry {
                entry,
                effective_end: entry.effective_end(state),
            })
            .filter(|w| w.entry.activation_time < window_end && w.effective_end > now)
            .collect();

        list.sort_by_key(|w| w.entry.activation_time);
        list
    }

    /// Free gaps of the window after subtracting every window entry
    #[must_use]
    pub fn free_gaps(&self, device_id: DeviceId, state: &DeviceState) -> Vec<TimeGap> {
        let now = state.device_time;
        let mut gaps = vec![TimeGap::new(now, now + Duration::hours(24))];

        for window_entry in self.window_entries(device_id, state) {
            gaps = subtract(gaps, window_entry.entry.activation_time, window_entry.effective_end);
        }

        gaps.retain(|gap| gap.end > gap.start);
        gaps.sort_by_key(|gap| gap.start);
        gaps
    }

    /// Gap a new bath program should be placed in
    ///
    /// The latest gap of at least [`PREFERRED_BATH_MINUTES`] wins, otherwise
    /// the longest one. An untouched window moves to the next local noon. A
    /// gap longer than the preferred bath is shifted forward by the excess.
    #[must_use]
    pub fn preferred_gap(&self, device_id: DeviceId, state: &DeviceState) -> Option<TimeGap> {
        let gaps = self.free_gaps(device_id, state);
        let preferred = Duration::minutes(PREFERRED_BATH_MINUTES);

        let mut gap = *gaps
            .iter()
            .rev()
            .find(|gap| gap.span() >= preferred)
            .or_else(|| gaps.iter().max_by_key(|gap| gap.span()))?;

        if gap.span() == Duration::hours(24) {
            let noon = self.next_noon(state.device_time)?;
            gap = TimeGap::new(noon, noon + preferred);
        }

        if gap.span() > preferred {
            let excess = gap.span() - preferred;
            gap.start += excess;
            gap.end += excess;
        }
        gap.minutes = gap.span().num_minutes().min(PREFERRED_BATH_MINUTES);
        Some(gap)
    }

    fn next_noon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.noon_offset);
        let noon_naive = local.date_naive().and_hms_opt(12, 0, 0)?;
        let mut noon = self.noon_offset.from_local_datetime(&noon_naive).single()?;
        if local > noon {
            noon += Duration::days(1);
        }
        Some(noon.with_timezone(&Utc))
    }

    /// First date slot that is empty, invalid or already over
    ///
    /// Returns `None` until the device has reported its full calendar.
    #[must_use]
    pub fn first_free_slot(&self, device_id: DeviceId, state: &DeviceState) -> Option<u8> {
        let slots = self.entries.get(&device_id)?;
        if slots.len() < CALENDAR_SLOTS {
            return None;
        }
        (FIRST_DATE_PROGRAM..=LAST_DATE_PROGRAM).find(|&index| {
            match slots.get(usize::from(index)).and_then(Option::as_ref) {
                None => true,
                Some(entry) => !entry.valid || entry.effective_end(state) < state.device_time,
            }
        })
    }

    /// Build a new entry in the first free slot at the preferred gap
    #[must_use]
    pub fn synthesize_entry(&self, device_id: DeviceId, state: &DeviceState) -> Option<CalendarEntry> {
        let index = self.first_free_slot(device_id, state)?;
        let gap = self.preferred_gap(device_id, state)?;
        Some(CalendarEntry {
            index,
            valid: true,
            activation_time: gap.start,
            end_time: gap.start.checked_add_signed(Duration::minutes(gap.minutes))?,
            bath_time: u16::try_from(gap.minutes).unwrap_or(0),
            temperature_set_point: state.target_temperature,
            humidity_set_point: state.target_humidity,
            weekday: false,
            start_mode: START_MODE_READY_AT,
            standby: false,
            favorite: None,
        })
    }

    /// Cached working entry, else a copy of the stored slot, else a new one
    pub fn working_entry(
        &mut self,
        device_id: DeviceId,
        index: Option<u8>,
        state: &DeviceState,
    ) -> Option<&WorkingEntry> {
        if !self.working.contains_key(&device_id) {
            let working = match index.and_then(|i| self.entry(device_id, i)) {
                Some(stored) => WorkingEntry {
                    entry: stored.clone(),
                    freshly_created: false,
                },
                None => WorkingEntry {
                    entry: self.synthesize_entry(device_id, state)?,
                    freshly_created: true,
                },
            };
            self.working.insert(device_id, working);
        }
        self.working.get(&device_id)
    }

    /// Drop the working entry of a device
    pub fn clear_working_entry(&mut self, device_id: DeviceId) {
        self.working.remove(&device_id);
    }
}

/// Remove `[start, end)` from every gap
fn subtract(gaps: Vec<TimeGap>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeGap> {
    let mut out = Vec::with_capacity(gaps.len() + 1);
    for gap in gaps {
        if gap.start >= start && gap.end <= end {
            // covered
        } else if gap.start >= end || gap.end <= start {
            out.push(gap);
        } else if gap.start < start && gap.end > end {
            out.push(TimeGap::new(gap.start, start));
            out.push(TimeGap::new(end, gap.end));
        } else if gap.start < start {
            out.push(TimeGap::new(gap.start, start));
        } else {
            out.push(TimeGap::new(end, gap.end));
        }
    }
    out
}
