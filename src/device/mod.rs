//! Device control: the capability interface the orchestration layer
//! consumes, and its ADB-backed implementation.
//!
//! The benchmark never drives UI automation itself; agents do that. What
//! the harness needs from a device is narrow: discovery, app lifecycle
//! around an attempt, input-method selection before an attempt, and the
//! raw interaction primitives exposed for completeness of the capability
//! surface.

pub mod emulator;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DeviceError;

/// One Android device under benchmark control.
///
/// Console/grpc ports are only present for emulator instances launched by
/// the harness; attached hardware devices carry the serial alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub console_port: Option<u16>,
    pub grpc_port: Option<u16>,
}

impl Device {
    /// A plain attached device known only by serial.
    pub fn attached(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            console_port: None,
            grpc_port: None,
        }
    }

    pub fn is_emulator(&self) -> bool {
        self.serial.starts_with("emulator-")
    }
}

/// On-device automation primitives, consumed as a capability interface.
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Captures a screenshot to the given on-host path.
    async fn screenshot(&self, device: &Device, dest: &std::path::Path)
        -> Result<(), DeviceError>;

    /// Taps at pixel coordinates.
    async fn tap(&self, device: &Device, x: u32, y: u32) -> Result<(), DeviceError>;

    /// Swipes between two points over the given duration.
    async fn swipe(
        &self,
        device: &Device,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: u32,
    ) -> Result<(), DeviceError>;

    /// Types text into the focused field.
    async fn input_text(&self, device: &Device, text: &str) -> Result<(), DeviceError>;

    /// Opens an app at its home activity, falling back to a launcher
    /// intent. Returns whether the app reached the foreground.
    async fn launch_app(
        &self,
        device: &Device,
        package: &str,
        activity: &str,
    ) -> Result<bool, DeviceError>;

    /// Force-stops an app; with `kill_all` set, first stops every
    /// foreground task so the next attempt starts from a clean screen.
    async fn stop_app(
        &self,
        device: &Device,
        package: Option<&str>,
        kill_all: bool,
    ) -> Result<(), DeviceError>;

    /// Selects the active input method.
    async fn set_input_method(&self, device: &Device, ime: &str) -> Result<(), DeviceError>;
}

/// IME identifier of the ADB keyboard used for CJK text input.
pub const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// ADB-backed implementation of [`DeviceCapability`].
#[derive(Debug, Clone)]
pub struct AdbController {
    adb_path: String,
}

impl AdbController {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    /// Runs an adb invocation and returns trimmed stdout.
    pub async fn exec(&self, args: &[&str]) -> Result<String, DeviceError> {
        let output = tokio::process::Command::new(&self.adb_path)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DeviceError::AdbFailed {
                command: format!("{} {}", self.adb_path, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn shell(&self, device: &Device, command: &str) -> Result<String, DeviceError> {
        self.exec(&["-s", &device.serial, "shell", command]).await
    }

    /// Lists attached devices reported by `adb devices`.
    pub async fn list_devices(&self) -> Result<Vec<Device>, DeviceError> {
        let raw = self.exec(&["devices"]).await?;
        Ok(parse_devices_output(&raw)
            .into_iter()
            .filter(|(_, status)| status == "device")
            .map(|(serial, _)| Device::attached(serial))
            .collect())
    }

    /// Whether the device reports a finished boot.
    pub async fn boot_completed(&self, device: &Device) -> bool {
        matches!(
            self.shell(device, "getprop sys.boot_completed").await,
            Ok(ref s) if s == "1"
        )
    }

    /// Selects the input method for a task: the ADB keyboard for Chinese
    /// tasks or agents that declare it as their default, otherwise the
    /// configured platform IME.
    pub async fn select_keyboard(
        &self,
        device: &Device,
        use_adb_keyboard: bool,
        default_ime: &str,
    ) -> Result<(), DeviceError> {
        if use_adb_keyboard {
            self.shell(device, &format!("ime enable {}", ADB_KEYBOARD_IME))
                .await?;
            self.set_input_method(device, ADB_KEYBOARD_IME).await
        } else {
            self.set_input_method(device, default_ime).await
        }
    }

    /// Waits until the given package holds window focus, up to `max_checks`
    /// one-second probes.
    async fn wait_for_focus(&self, device: &Device, package: &str, max_checks: u32) {
        let focus_re = regex::Regex::new(
            r"mCurrentFocus=Window\{.*\s+(?P<package>[^\s/]+)/(?P<activity>[^\s}]+)\}",
        )
        .expect("static regex");
        for _ in 0..max_checks {
            let Ok(windows) = self
                .shell(device, "dumpsys window | grep -E mCurrentFocus")
                .await
            else {
                return;
            };
            if let Some(caps) = focus_re.captures(&windows) {
                if &caps["package"] == package {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[async_trait]
impl DeviceCapability for AdbController {
    async fn screenshot(
        &self,
        device: &Device,
        dest: &std::path::Path,
    ) -> Result<(), DeviceError> {
        self.shell(device, "screencap -p /sdcard/droid_bench_screen.png")
            .await?;
        self.exec(&[
            "-s",
            &device.serial,
            "pull",
            "/sdcard/droid_bench_screen.png",
            &dest.to_string_lossy(),
        ])
        .await?;
        Ok(())
    }

    async fn tap(&self, device: &Device, x: u32, y: u32) -> Result<(), DeviceError> {
        self.shell(device, &format!("input tap {} {}", x, y)).await?;
        Ok(())
    }

    async fn swipe(
        &self,
        device: &Device,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: u32,
    ) -> Result<(), DeviceError> {
        self.shell(
            device,
            &format!(
                "input swipe {} {} {} {} {}",
                from.0, from.1, to.0, to.1, duration_ms
            ),
        )
        .await?;
        Ok(())
    }

    async fn input_text(&self, device: &Device, text: &str) -> Result<(), DeviceError> {
        self.shell(device, &format!("input text '{}'", text.replace(' ', "%s")))
            .await?;
        Ok(())
    }

    async fn launch_app(
        &self,
        device: &Device,
        package: &str,
        activity: &str,
    ) -> Result<bool, DeviceError> {
        // Start from a stopped app so every attempt sees the same screen.
        self.stop_app(device, Some(package), true).await?;

        let mut launched = false;
        if !package.is_empty() && !activity.is_empty() {
            let start = self
                .shell(device, &format!("am start -n {}/{}", package, activity))
                .await;
            launched = start.is_ok();
        }
        if !launched && !package.is_empty() {
            let monkey = self
                .shell(
                    device,
                    &format!("monkey -p {} -c android.intent.category.LAUNCHER 1", package),
                )
                .await;
            launched = monkey.is_ok();
        }

        if launched {
            self.wait_for_focus(device, package, 30).await;
            // App content needs a moment after focus lands.
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        } else {
            warn!(
                serial = %device.serial,
                package, "App launch failed; returning to home screen"
            );
            self.shell(device, "input keyevent KEYCODE_HOME").await?;
            Ok(false)
        }
    }

    async fn stop_app(
        &self,
        device: &Device,
        package: Option<&str>,
        kill_all: bool,
    ) -> Result<(), DeviceError> {
        if kill_all {
            let sweep = "dumpsys activity | grep topActivity | \
                         sed -n 's/.*{\\([^\\/]*\\)\\/.*/\\1/p' | \
                         while read -r package; do am force-stop $package; done";
            if let Err(e) = self.shell(device, sweep).await {
                debug!(serial = %device.serial, error = %e, "Foreground sweep failed");
            }
        }
        if let Some(package) = package {
            self.shell(device, &format!("am force-stop {}", package))
                .await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }

    async fn set_input_method(&self, device: &Device, ime: &str) -> Result<(), DeviceError> {
        self.shell(device, &format!("ime set {}", ime)).await?;
        Ok(())
    }
}

/// Parses the output of `adb devices` into (serial, status) pairs.
pub fn parse_devices_output(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some(status)) => Some((serial.to_string(), status.to_string())),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_output() {
        let raw = "List of devices attached\nemulator-5554\tdevice\nR58M123ABC\toffline\n";
        let devices = parse_devices_output(raw);
        assert_eq!(
            devices,
            vec![
                ("emulator-5554".to_string(), "device".to_string()),
                ("R58M123ABC".to_string(), "offline".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_devices_output_empty() {
        assert!(parse_devices_output("List of devices attached\n").is_empty());
    }

    #[test]
    fn test_device_is_emulator() {
        assert!(Device::attached("emulator-5554").is_emulator());
        assert!(!Device::attached("R58M123ABC").is_emulator());
    }
}
