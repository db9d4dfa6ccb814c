//! Slot addressing and day-string encoding of the battery time control

use crate::{
    error::{Error, Result},
    services::settings::Settings,
};
use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, time::Duration};

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;
const SETTING_KEY_PREFIX: &str = "Battery:TimeControl:Conf";

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Battery behaviour during one slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ScheduleState {
    Unrestricted = 0,
    ChargeBlocked = 1,
    DischargeBlocked = 2,
}

impl ScheduleState {
    pub fn from_digit(digit: char) -> Result<Self> {
        match digit {
            '0' => Ok(Self::Unrestricted),
            '1' => Ok(Self::ChargeBlocked),
            '2' => Ok(Self::DischargeBlocked),
            other => Err(Error::validation(format!(
                "invalid schedule digit '{other}'"
            ))),
        }
    }

    pub fn as_digit(self) -> char {
        match self {
            Self::Unrestricted => '0',
            Self::ChargeBlocked => '1',
            Self::DischargeBlocked => '2',
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_digit())
    }
}

fn weekday_abbreviation(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

/// Device setting holding the schedule of `weekday`
pub fn setting_key_for(weekday: Weekday) -> String {
    format!("{SETTING_KEY_PREFIX}{}", weekday_abbreviation(weekday))
}

pub fn weekday_for_key(key: &str) -> Option<Weekday> {
    let abbreviation = key.strip_prefix(SETTING_KEY_PREFIX)?;
    WEEKDAYS
        .into_iter()
        .find(|weekday| weekday_abbreviation(*weekday) == abbreviation)
}

/// All seven time control setting keys, Monday first
pub fn time_control_keys() -> Vec<String> {
    WEEKDAYS.into_iter().map(setting_key_for).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAddress {
    pub weekday: Weekday,
    pub slot: usize,
}

/// Maps timestamps onto weekday slots in a fixed time zone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleCodec {
    time_zone: Tz,
    slot_secs: u32,
}

impl ScheduleCodec {
    /// The slot duration must be whole seconds and divide a day evenly.
    pub fn new(time_zone: Tz, slot_duration: Duration) -> Result<Self> {
        let secs = slot_duration.as_secs();
        if slot_duration.subsec_nanos() != 0
            || secs == 0
            || secs > u64::from(SECONDS_PER_DAY)
            || u64::from(SECONDS_PER_DAY) % secs != 0
        {
            return Err(Error::validation(format!(
                "slot duration {slot_duration:?} does not divide a day evenly"
            )));
        }

        Ok(Self {
            time_zone,
            slot_secs: secs as u32,
        })
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn slot_duration(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.slot_secs))
    }

    pub fn slots_per_day(&self) -> usize {
        (SECONDS_PER_DAY / self.slot_secs) as usize
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.time_zone)
    }

    pub fn from_epoch_secs(&self, secs: i64) -> Result<DateTime<Tz>> {
        DateTime::from_timestamp(secs, 0)
            .map(|t| t.with_timezone(&self.time_zone))
            .ok_or_else(|| Error::validation(format!("timestamp {secs} out of range")))
    }

    pub fn address_for(&self, timestamp: &DateTime<Tz>) -> Result<SlotAddress> {
        let local = timestamp.with_timezone(&self.time_zone);
        let slot = (local.num_seconds_from_midnight() / self.slot_secs) as usize;
        self.check_slot(slot)?;

        Ok(SlotAddress {
            weekday: local.weekday(),
            slot,
        })
    }

    /// Half-open `[start, end)` of the slot containing `timestamp`
    pub fn slot_bounds(&self, timestamp: &DateTime<Tz>) -> (DateTime<Tz>, DateTime<Tz>) {
        let local = timestamp.with_timezone(&self.time_zone);
        let offset = TimeDelta::seconds(i64::from(
            local.num_seconds_from_midnight() % self.slot_secs,
        )) + TimeDelta::nanoseconds(i64::from(local.nanosecond()));
        let start = local - offset;
        (start, start + self.slot_duration())
    }

    pub fn read_slot(&self, day: &str, slot: usize) -> Result<ScheduleState> {
        self.validate_day(day)?;
        self.check_slot(slot)?;

        day.chars()
            .nth(slot)
            .ok_or_else(|| Error::validation(format!("slot {slot} missing in day schedule")))
            .and_then(ScheduleState::from_digit)
    }

    /// Copy of `day` with only position `slot` replaced by `state`
    pub fn write_slot(&self, day: &str, slot: usize, state: ScheduleState) -> Result<String> {
        self.validate_day(day)?;
        self.check_slot(slot)?;

        Ok(day
            .chars()
            .enumerate()
            .map(|(i, c)| if i == slot { state.as_digit() } else { c })
            .collect())
    }

    pub fn validate_day(&self, day: &str) -> Result<()> {
        validate_digits(day)?;
        if day.len() != self.slots_per_day() {
            return Err(Error::validation(format!(
                "day schedule has {} slots, expected {}",
                day.len(),
                self.slots_per_day()
            )));
        }
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slots_per_day() {
            return Err(Error::validation(format!(
                "slot {slot} out of range 0..{}",
                self.slots_per_day()
            )));
        }
        Ok(())
    }
}

fn validate_digits(day: &str) -> Result<()> {
    day.chars().try_for_each(|c| ScheduleState::from_digit(c).map(|_| ()))
}

/// The time control of a whole week as stored on the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeekdaySchedule {
    days: [String; 7],
}

impl WeekdaySchedule {
    /// Build from device settings; every weekday key must be present
    ///
    /// All days must consist of valid digits and share one length. Keys other
    /// than the time control keys are ignored.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut days: [String; 7] = Default::default();

        for (day, weekday) in days.iter_mut().zip(WEEKDAYS) {
            let key = setting_key_for(weekday);
            let value = settings
                .get(&key)
                .ok_or_else(|| Error::protocol(format!("time control setting {key} missing")))?;
            validate_digits(value)?;
            *day = value.clone();
        }

        if days.iter().any(|day| day.len() != days[0].len()) {
            return Err(Error::validation(
                "time control days differ in number of slots",
            ));
        }

        Ok(Self { days })
    }

    pub fn day(&self, weekday: Weekday) -> &str {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    pub fn to_settings(&self) -> Settings {
        WEEKDAYS
            .into_iter()
            .map(|weekday| (setting_key_for(weekday), self.day(weekday).to_string()))
            .collect()
    }
}
