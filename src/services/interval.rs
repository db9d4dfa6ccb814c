//! A single tracked override of one schedule slot

use crate::{
    error::Result,
    services::schedule::{self, ScheduleCodec, ScheduleState, SlotAddress},
    time_control_client::{TimeControl, TimeControlUpdate},
};
use chrono::{DateTime, TimeDelta};
use chrono_tz::Tz;
use log::info;
use std::fmt;

/// Optional construction inputs; anything missing is taken from the device
#[derive(Clone, Copy, Debug, Default)]
pub struct IntervalOptions {
    /// Defaults to whether the original state is `DischargeBlocked`
    pub blocked: Option<bool>,
    /// Defaults to the slot's current digit on the device
    pub original_state: Option<ScheduleState>,
}

/// One slot `[start, end)` together with its digit before any override
#[derive(Clone, Debug)]
pub struct Interval {
    timepoint: DateTime<Tz>,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    address: SlotAddress,
    blocked: bool,
    original_state: ScheduleState,
    codec: ScheduleCodec,
}

impl Interval {
    pub fn new(
        timepoint: DateTime<Tz>,
        options: IntervalOptions,
        codec: ScheduleCodec,
        device: &dyn TimeControl,
    ) -> Result<Self> {
        let timepoint = timepoint.with_timezone(&codec.time_zone());
        let address = codec.address_for(&timepoint)?;
        let (start, end) = codec.slot_bounds(&timepoint);

        let original_state = match options.original_state {
            Some(state) => state,
            None => read_state(device, &codec, address)?,
        };
        let blocked = options
            .blocked
            .unwrap_or(original_state == ScheduleState::DischargeBlocked);

        Ok(Self {
            timepoint,
            start,
            end,
            address,
            blocked,
            original_state,
            codec,
        })
    }

    pub fn timepoint(&self) -> &DateTime<Tz> {
        &self.timepoint
    }

    pub fn start(&self) -> &DateTime<Tz> {
        &self.start
    }

    pub fn end(&self) -> &DateTime<Tz> {
        &self.end
    }

    pub fn address(&self) -> SlotAddress {
        self.address
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn original_state(&self) -> ScheduleState {
        self.original_state
    }

    /// Safe to revert once `grace` has passed after the slot end
    pub fn is_expired(&self, now: &DateTime<Tz>, grace: TimeDelta) -> bool {
        *now >= self.end + grace
    }

    pub fn contains(&self, t: &DateTime<Tz>) -> bool {
        self.start <= *t && *t < self.end
    }

    pub fn current_state(&self, device: &dyn TimeControl) -> Result<ScheduleState> {
        read_state(device, &self.codec, self.address)
    }

    /// Rewrite only this slot in today's day string on the device
    fn set_state(&self, device: &dyn TimeControl, state: ScheduleState) -> Result<()> {
        let schedule = device.read_time_controls()?;
        let day = self
            .codec
            .write_slot(schedule.day(self.address.weekday), self.address.slot, state)?;

        let update =
            TimeControlUpdate::from([(schedule::setting_key_for(self.address.weekday), day)]);
        device.write_time_controls(&update)
    }

    pub fn block(&mut self, device: &dyn TimeControl) -> Result<()> {
        info!("blocking {self}");
        self.set_state(device, ScheduleState::DischargeBlocked)?;
        self.blocked = true;
        Ok(())
    }

    pub fn unblock(&mut self, device: &dyn TimeControl) -> Result<()> {
        info!("unblocking {self}");
        self.set_state(device, ScheduleState::Unrestricted)?;
        self.blocked = false;
        Ok(())
    }

    pub fn revert(&mut self, device: &dyn TimeControl) -> Result<()> {
        info!("reverting {self}");
        self.set_state(device, self.original_state)?;
        self.blocked = self.original_state == ScheduleState::DischargeBlocked;
        Ok(())
    }

    pub fn update_blocked_from_device(&mut self, device: &dyn TimeControl) -> Result<()> {
        self.blocked = self.current_state(device)? == ScheduleState::DischargeBlocked;
        Ok(())
    }
}

fn read_state(
    device: &dyn TimeControl,
    codec: &ScheduleCodec,
    address: SlotAddress,
) -> Result<ScheduleState> {
    let schedule = device.read_time_controls()?;
    codec.read_slot(schedule.day(address.weekday), address.slot)
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Interval[{}, start={}, end={}, blocked={}, originalState={}]",
            self.timepoint, self.start, self.end, self.blocked, self.original_state
        )
    }
}
