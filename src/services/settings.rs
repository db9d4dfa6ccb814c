//! Batched read and write of named device settings

use crate::{
    error::{Error, Result},
    http_client::{Request, Transport},
    services::auth::AuthSession,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Setting id to value, as exchanged with the device
pub type Settings = BTreeMap<String, String>;

pub const DEVICE_MODULE_ID: &str = "devices:local";

const SETTINGS_ENDPOINT: &str = "/settings";

#[derive(Serialize)]
struct ReadRequest<'a> {
    moduleid: &'a str,
    settingids: &'a [&'a str],
}

#[derive(Deserialize, Serialize)]
struct SettingValue {
    id: String,
    value: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    moduleid: &'a str,
    settings: Vec<SettingValue>,
}

#[derive(Deserialize)]
struct ModuleSettings {
    moduleid: String,
    settings: Vec<SettingValue>,
}

/// Settings access within one module on top of an authenticated session
pub struct SettingsClient<'a, T: Transport> {
    session: &'a AuthSession<T>,
    module_id: &'a str,
}

impl<'a, T: Transport> SettingsClient<'a, T> {
    pub fn new(session: &'a AuthSession<T>) -> Self {
        Self::for_module(session, DEVICE_MODULE_ID)
    }

    pub fn for_module(session: &'a AuthSession<T>, module_id: &'a str) -> Self {
        Self { session, module_id }
    }

    /// Read the given settings in one request
    ///
    /// Either every requested id is returned or the call fails.
    pub fn read_settings(&self, ids: &[&str]) -> Result<Settings> {
        debug!("reading settings {ids:?}");
        let body = serde_json::to_value([ReadRequest {
            moduleid: self.module_id,
            settingids: ids,
        }])
        .map_err(|e| Error::protocol(format!("failed to serialize settings request: {e}")))?;

        let modules: Vec<ModuleSettings> = self
            .session
            .send(Request::post(SETTINGS_ENDPOINT, body))?
            .ensure_success("settings read")?
            .json("settings read")?;

        let mut settings: Settings = modules
            .into_iter()
            .filter(|module| module.moduleid == self.module_id)
            .flat_map(|module| module.settings)
            .map(|setting| (setting.id, setting.value))
            .collect();

        if let Some(missing) = ids.iter().find(|id| !settings.contains_key(**id)) {
            return Err(Error::protocol(format!(
                "failed to read settings: {missing} missing in response"
            )));
        }
        settings.retain(|id, _| ids.contains(&id.as_str()));

        Ok(settings)
    }

    /// Write all given settings in one request
    ///
    /// A non-2xx answer means nothing may be assumed changed.
    pub fn write_settings(&self, settings: &Settings) -> Result<()> {
        debug!("writing settings {settings:?}");
        let body = serde_json::to_value([WriteRequest {
            moduleid: self.module_id,
            settings: settings
                .iter()
                .map(|(id, value)| SettingValue {
                    id: id.clone(),
                    value: value.clone(),
                })
                .collect(),
        }])
        .map_err(|e| Error::protocol(format!("failed to serialize settings request: {e}")))?;

        self.session
            .send(Request::put(SETTINGS_ENDPOINT, body))?
            .ensure_success("settings write")?;

        Ok(())
    }
}
