//! The `block` and `revert` operations of the scheduler binary

use crate::{config::AppConfig, error::Result, services::interval_store::IntervalStore};
use chrono::DateTime;
use chrono_tz::Tz;
use log::info;

/// Keep the current slot (and the one a poll will reach next) blocked and
/// hand every expired override back to its original state
pub fn block(store: &mut IntervalStore<'_>, now: &DateTime<Tz>) -> Result<()> {
    store.block_current(now)?;
    store.revert_and_remove_expired_intervals(now)?;
    info!("block done, tracking {} intervals", store.intervals().len());
    Ok(())
}

/// Hand every tracked override back to its original state
pub fn revert(store: &mut IntervalStore<'_>) -> Result<()> {
    store.revert_and_remove_all_intervals()?;
    info!("revert done");
    Ok(())
}

pub fn usage(config: &AppConfig) -> String {
    format!(
        "Blocked intervals are tracked in {}.\n\
         Slots of {} minutes are kept blocked for a polling interval of {} seconds.",
        config.store.file.display(),
        config.schedule.codec.slot_duration().num_minutes(),
        config.schedule.poll_interval.as_secs()
    )
}
