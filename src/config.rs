use crate::services::{auth::Credential, schedule::ScheduleCodec};
use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;
use std::{env, fs, path::PathBuf, time::Duration};

/// Source of configuration values by variable name
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Device API access
    pub device: DeviceConfig,

    /// Slot layout and polling cadence
    pub schedule: ScheduleConfig,

    /// Override bookkeeping file
    pub store: StoreConfig,

    /// Privileged helper invocation
    pub helper: HelperConfig,
}

/// How the scheduler reaches the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceAccess {
    /// Through the `kostal-time-control` helper, no password needed
    Helper,
    /// In-process, requires the device password
    Direct,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub verify_server_signature: bool,
    pub access: DeviceAccess,
    credential: Option<Credential>,
}

#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    pub codec: ScheduleCodec,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub file: PathBuf,
}

#[derive(Clone, Debug)]
pub struct HelperConfig {
    /// Program followed by fixed leading arguments
    pub command: Vec<String>,
}

impl AppConfig {
    /// Load and validate all configuration from environment variables
    pub fn load() -> Result<Self> {
        Self::from_lookup(&|name: &str| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: Lookup) -> Result<Self> {
        let device = DeviceConfig::load(lookup)?;
        let schedule = ScheduleConfig::load(lookup)?;
        let store = StoreConfig::load(lookup)?;
        let helper = HelperConfig::load(lookup)?;

        Ok(Self {
            device,
            schedule,
            store,
            helper,
        })
    }
}

fn parse_secs(lookup: Lookup, name: &str, default: u64) -> Result<Duration> {
    let secs = match lookup(name) {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("failed to parse {name}: invalid format"))?,
        None => default,
    };
    if secs == 0 {
        bail!("failed to parse {name}: must be positive");
    }
    Ok(Duration::from_secs(secs))
}

impl DeviceConfig {
    fn load(lookup: Lookup) -> Result<Self> {
        let base_url = lookup("DEVICE_BASE_URL")
            .unwrap_or_else(|| "http://192.168.178.40/api/v1".to_string());

        let timeout = parse_secs(lookup, "DEVICE_TIMEOUT_SECS", 10)?;

        let verify_server_signature = lookup("DEVICE_VERIFY_SERVER_SIGNATURE")
            .unwrap_or_else(|| "true".to_string())
            .parse::<bool>()
            .context("failed to parse DEVICE_VERIFY_SERVER_SIGNATURE: invalid format")?;

        let access = match lookup("DEVICE_ACCESS").as_deref() {
            None | Some("helper") => DeviceAccess::Helper,
            Some("direct") => DeviceAccess::Direct,
            Some(other) => bail!("failed to parse DEVICE_ACCESS: unknown value {other}"),
        };

        let credential = match (lookup("DEVICE_PASSWORD_FILE"), lookup("DEVICE_PASSWORD")) {
            (Some(file), _) => {
                let password = fs::read_to_string(&file)
                    .with_context(|| format!("failed to read password file {file}"))?;
                Some(Credential::new(password.trim_end_matches(['\r', '\n'])))
            }
            (None, Some(password)) => Some(Credential::new(password)),
            (None, None) => None,
        };

        Ok(Self {
            base_url,
            timeout,
            verify_server_signature,
            access,
            credential,
        })
    }

    pub fn credential(&self) -> Result<&Credential> {
        self.credential
            .as_ref()
            .context("failed to get device password: neither DEVICE_PASSWORD_FILE nor DEVICE_PASSWORD is set")
    }
}

impl ScheduleConfig {
    fn load(lookup: Lookup) -> Result<Self> {
        let time_zone = lookup("SCHEDULE_TIME_ZONE")
            .unwrap_or_else(|| "Europe/Berlin".to_string())
            .parse::<Tz>()
            .map_err(|e| anyhow!("failed to parse SCHEDULE_TIME_ZONE: {e}"))?;

        let slot_minutes = lookup("SCHEDULE_SLOT_MINUTES")
            .unwrap_or_else(|| "15".to_string())
            .parse::<u64>()
            .context("failed to parse SCHEDULE_SLOT_MINUTES: invalid format")?;

        let slot_secs = slot_minutes
            .checked_mul(60)
            .context("failed to parse SCHEDULE_SLOT_MINUTES: out of range")?;
        let codec = ScheduleCodec::new(time_zone, Duration::from_secs(slot_secs))
            .context("failed to parse SCHEDULE_SLOT_MINUTES")?;

        let poll_interval = parse_secs(lookup, "POLL_INTERVAL_SECS", 60)?;

        Ok(Self {
            codec,
            poll_interval,
        })
    }
}

impl StoreConfig {
    fn load(lookup: Lookup) -> Result<Self> {
        let file = lookup("INTERVAL_STORE_FILE")
            .unwrap_or_else(|| "/var/cache/kostal/blocked-intervals.json".to_string())
            .into();

        Ok(Self { file })
    }
}

impl HelperConfig {
    fn load(lookup: Lookup) -> Result<Self> {
        let command: Vec<String> = lookup("TIME_CONTROL_HELPER")
            .unwrap_or_else(|| "kostal-time-control".to_string())
            .split_whitespace()
            .map(String::from)
            .collect();

        if command.is_empty() {
            bail!("failed to parse TIME_CONTROL_HELPER: empty command");
        }

        Ok(Self { command })
    }
}
