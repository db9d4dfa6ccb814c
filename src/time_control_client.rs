//! Access to the device battery time control
//!
//! [`TimeControl`] is the only way the override bookkeeping talks to the
//! device. [`DirectTimeControl`] holds the password and speaks the device API
//! in-process; [`HelperTimeControl`] delegates both operations to a separate,
//! privileged `kostal-time-control` process so the caller never sees the
//! password.

use crate::{
    config::DeviceConfig,
    error::{Error, Result},
    http_client::{HttpTransport, Transport},
    services::{
        auth::{AuthSession, Credential, SessionState},
        schedule::{self, ScheduleCodec, WeekdaySchedule},
        settings::{Settings, SettingsClient},
    },
};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{
    cell::{Ref, RefCell},
    process::Command,
};

/// Setting key to day string for one or more weekdays
pub type TimeControlUpdate = Settings;

#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait TimeControl {
    fn read_time_controls(&self) -> Result<WeekdaySchedule>;
    fn write_time_controls(&self, update: &TimeControlUpdate) -> Result<()>;
}

/// Every value must be a complete day string for the slot layout of `codec`
fn validate_update(codec: &ScheduleCodec, update: &TimeControlUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(Error::validation("time control update is empty"));
    }

    for (key, day) in update {
        if schedule::weekday_for_key(key).is_none() {
            return Err(Error::validation(format!(
                "{key} is not a time control setting"
            )));
        }
        codec.validate_day(day).map_err(|e| match e {
            Error::Validation(msg) => Error::validation(format!("{key}: {msg}")),
            other => other,
        })?;
    }
    Ok(())
}

/// In-process device access, logging in on first use
pub struct DirectTimeControl<T: Transport> {
    session: RefCell<AuthSession<T>>,
    credential: Credential,
    codec: ScheduleCodec,
}

impl DirectTimeControl<HttpTransport> {
    pub fn over_http(
        config: &DeviceConfig,
        credential: Credential,
        codec: ScheduleCodec,
    ) -> Result<Self> {
        let transport = HttpTransport::new(&config.base_url, config.timeout)?;
        Ok(Self::with_transport(
            transport,
            credential,
            config.verify_server_signature,
            codec,
        ))
    }
}

impl<T: Transport> DirectTimeControl<T> {
    pub fn with_transport(
        transport: T,
        credential: Credential,
        verify_server_signature: bool,
        codec: ScheduleCodec,
    ) -> Self {
        Self {
            session: RefCell::new(AuthSession::new(transport, verify_server_signature)),
            credential,
            codec,
        }
    }

    fn session(&self) -> Result<Ref<'_, AuthSession<T>>> {
        let state = self.session.borrow().state();
        match state {
            SessionState::Authenticated => {}
            SessionState::Unauthenticated => self.session.borrow_mut().login(&self.credential)?,
            other => {
                return Err(Error::authentication(format!(
                    "failed to use device session in state {other:?}"
                )));
            }
        }
        Ok(self.session.borrow())
    }

    /// Log out from the device; dropping the value does the same
    pub fn close(&self) {
        self.session.borrow_mut().logout();
    }
}

impl<T: Transport> TimeControl for DirectTimeControl<T> {
    fn read_time_controls(&self) -> Result<WeekdaySchedule> {
        let keys = schedule::time_control_keys();
        let ids: Vec<&str> = keys.iter().map(String::as_str).collect();

        let session = self.session()?;
        let settings = SettingsClient::new(&*session).read_settings(&ids)?;
        WeekdaySchedule::from_settings(&settings)
    }

    fn write_time_controls(&self, update: &TimeControlUpdate) -> Result<()> {
        validate_update(&self.codec, update)?;

        let session = self.session()?;
        SettingsClient::new(&*session).write_settings(update)
    }
}

/// Device access through the privileged helper executable
///
/// The helper understands `read`, printing the schedule as a JSON object, and
/// `write <json>`.
#[derive(Debug)]
pub struct HelperTimeControl {
    program: String,
    args: Vec<String>,
    codec: ScheduleCodec,
}

impl HelperTimeControl {
    /// `command` is the program followed by fixed leading arguments, e.g.
    /// `["sudo", "-u", "kostal", "kostal-time-control"]`
    pub fn new(command: &[String], codec: ScheduleCodec) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::validation("time control helper command is empty"))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            codec,
        })
    }

    fn run(&self, operation: &[&str]) -> Result<Vec<u8>> {
        debug!("running {} {:?} {}", self.program, self.args, operation[0]);

        let output = Command::new(&self.program)
            .args(&self.args)
            .args(operation)
            .output()
            .map_err(|e| Error::transport(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(Error::transport(format!(
                "{} {} failed with {}: {}",
                self.program,
                operation[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl TimeControl for HelperTimeControl {
    fn read_time_controls(&self) -> Result<WeekdaySchedule> {
        let stdout = self.run(&["read"])?;
        let settings: Settings = serde_json::from_slice(&stdout).map_err(|e| {
            Error::protocol(format!("failed to parse time controls from helper: {e}"))
        })?;

        WeekdaySchedule::from_settings(&settings)
    }

    fn write_time_controls(&self, update: &TimeControlUpdate) -> Result<()> {
        validate_update(&self.codec, update)?;

        let json = serde_json::to_string(update)
            .map_err(|e| Error::protocol(format!("failed to serialize time controls: {e}")))?;
        self.run(&["write", &json])?;
        Ok(())
    }
}
