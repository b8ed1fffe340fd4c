//! Device configuration.
//!
//! A [`DeviceConfig`] names the port and its line settings. It is built by
//! the caller (in code or from a JSON file) and handed to the
//! [`Registry`](crate::registry::Registry), after which the device only ever
//! reads it.

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use strum::{Display, EnumString};

use crate::error::{Error, OpenError, Result};

/// Baud rates accepted by [`DeviceConfig::validate`].
pub const STANDARD_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200,
    38400, 57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000,
    1152000, 1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

/// Serial line and timeout settings for one device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Device path or identifier (e.g. "/dev/ttyUSB0", "COM3")
    pub path: String,

    /// Baud rate, one of [`STANDARD_BAUD_RATES`]
    pub baud_rate: u32,

    #[serde(default)]
    pub data_bits: DataBits,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub stop_bits: StopBits,

    /// Passed through to the OS; no flow-control policy of our own
    #[serde(default)]
    pub flow_control: FlowControl,

    #[serde(default)]
    pub read_timeout: ReadTimeout,

    /// Upper bound on a single write; `None` waits as long as the
    /// transport applies backpressure
    #[serde(default, with = "option_millis")]
    pub write_timeout: Option<Duration>,
}

impl DeviceConfig {
    /// Create a configuration with 8N1 framing, no flow control, a one
    /// second read timeout and no write timeout.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            read_timeout: ReadTimeout::default(),
            write_timeout: None,
        }
    }

    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: ReadTimeout) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = Some(write_timeout);
        self
    }

    /// Check the settings every transport requires.
    ///
    /// Backends may reject further combinations when opening (the serial
    /// backend, for instance, has no 1.5 stop bit mode).
    pub fn validate(&self) -> std::result::Result<(), OpenError> {
        if self.path.is_empty() {
            return Err(OpenError::InvalidConfig("empty device path".to_string()));
        }
        if !STANDARD_BAUD_RATES.contains(&self.baud_rate) {
            return Err(OpenError::InvalidConfig(format!(
                "baud rate {} is not a standard rate",
                self.baud_rate
            )));
        }
        // Zero is spelled NonBlocking or Infinite, never a deadline.
        if self.read_timeout == ReadTimeout::After(Duration::ZERO) {
            return Err(OpenError::InvalidConfig(
                "zero read timeout; use non_blocking or infinite".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Number of data bits per character.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize, Serialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    #[strum(serialize = "5")]
    Five,
    #[strum(serialize = "6")]
    Six,
    #[strum(serialize = "7")]
    Seven,
    #[default]
    #[strum(serialize = "8")]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("data bits must be 5-8, got {other}")),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Parity checking mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Number of stop bits per character.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize, Serialize,
)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    #[strum(serialize = "1")]
    One,
    #[serde(rename = "1.5")]
    #[strum(serialize = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    #[strum(serialize = "2")]
    Two,
}

/// Flow control mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// How long [`InputStream::read`](crate::stream::InputStream::read) waits
/// for the first byte.
///
/// `Ok(0)` from a read only ever means "nothing buffered" under
/// `NonBlocking`; the other policies either return data or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadTimeout {
    /// Poll once and return `Ok(0)` if nothing is buffered.
    NonBlocking,
    /// Wait until a byte arrives or the channel closes.
    Infinite,
    /// Wait up to the given duration, then fail with `IoError::Timeout`.
    /// Must be non-zero. Serialized as milliseconds.
    After(#[serde(with = "millis")] Duration),
}

impl Default for ReadTimeout {
    fn default() -> Self {
        ReadTimeout::After(Duration::from_secs(1))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
