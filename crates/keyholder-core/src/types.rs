//! Shared types and OpenAPI schemas.
//!
//! Wire types exchanged between the control surface and the device. Session
//! and registry types live in their own modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Number of lock channels a device can drive.
pub const CHANNEL_COUNT: u8 = 4;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,
}

/// Optional deterrents and channel enables configured at provisioning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct DeviceFeatures {
    /// Track consecutive completed sessions.
    pub streaks: bool,
    /// Hide a reward code until a session completes; enables the penalty phase.
    pub reward_code: bool,
    /// Add payback debt to the next session after a hard abort.
    pub payback: bool,
    /// Enabled lock channels, index 0 is channel 1.
    pub channels: [bool; CHANNEL_COUNT as usize],
    /// Debt added per hard abort.
    #[schema(example = 600)]
    pub payback_secs: u16,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            streaks: true,
            reward_code: true,
            payback: true,
            channels: [true, false, false, false],
            payback_secs: 600,
        }
    }
}

impl DeviceFeatures {
    /// Whether `channel` (1-based) exists and is enabled.
    #[must_use]
    pub fn channel_enabled(&self, channel: u8) -> bool {
        channel
            .checked_sub(1)
            .and_then(|i| self.channels.get(usize::from(i)))
            .copied()
            .unwrap_or(false)
    }
}

/// Wi-Fi credentials pushed to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct WifiCredentials {
    /// Network SSID (1 to 32 bytes).
    #[schema(example = "home-network")]
    pub ssid: String,

    /// WPA passphrase (up to 63 bytes, may be empty for open networks).
    #[schema(example = "correct horse battery staple")]
    pub password: String,
}

impl WifiCredentials {
    /// Maximum SSID length in bytes.
    pub const MAX_SSID_LEN: usize = 32;
    /// Maximum passphrase length in bytes.
    pub const MAX_PASSWORD_LEN: usize = 63;

    /// Validate lengths.
    ///
    /// # Errors
    ///
    /// Returns the name of the offending field and a message.
    pub fn check(&self) -> Result<(), (&'static str, String)> {
        if self.ssid.is_empty() || self.ssid.len() > Self::MAX_SSID_LEN {
            return Err((
                "ssid",
                format!("must be 1 to {} bytes", Self::MAX_SSID_LEN),
            ));
        }
        if self.password.len() > Self::MAX_PASSWORD_LEN {
            return Err((
                "password",
                format!("must be at most {} bytes", Self::MAX_PASSWORD_LEN),
            ));
        }
        Ok(())
    }
}

/// Static device information returned by `GET /details`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceDetails {
    /// Device name.
    #[schema(example = "Keyholder")]
    pub name: String,
    /// Firmware version string.
    #[schema(example = "0.1.0")]
    pub firmware_version: String,
    /// MAC address, when known.
    pub mac: Option<String>,
    /// Configured Wi-Fi network.
    pub wifi_ssid: Option<String>,
    /// Provisioned features.
    pub features: DeviceFeatures,
}

/// One line of the device event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogLine {
    /// When the event happened.
    pub at_utc: DateTime<Utc>,
    /// Event text.
    #[schema(example = "locked -> aborted (watchdog)")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_enabled_bounds() {
        let features = DeviceFeatures {
            channels: [true, false, true, false],
            ..DeviceFeatures::default()
        };
        assert!(features.channel_enabled(1));
        assert!(!features.channel_enabled(2));
        assert!(features.channel_enabled(3));
        assert!(!features.channel_enabled(0));
        assert!(!features.channel_enabled(5));
    }

    #[test]
    fn test_wifi_credentials_check() {
        let ok = WifiCredentials {
            ssid: "home".into(),
            password: String::new(),
        };
        assert!(ok.check().is_ok());

        let empty = WifiCredentials {
            ssid: String::new(),
            password: "x".into(),
        };
        assert_eq!(empty.check().unwrap_err().0, "ssid");

        let long_pass = WifiCredentials {
            ssid: "home".into(),
            password: "p".repeat(64),
        };
        assert_eq!(long_pass.check().unwrap_err().0, "password");
    }

    #[test]
    fn test_wifi_credentials_reject_unknown_fields() {
        let json = r#"{"ssid": "a", "password": "b", "extra": 1}"#;
        assert!(serde_json::from_str::<WifiCredentials>(json).is_err());
    }
}
