//! Emulator fleet lifecycle.
//!
//! Launches N headless emulator instances on deterministic console/grpc
//! ports, waits for them to attach and finish booting, and kills them at
//! session teardown. Only devices launched here are ever destroyed.

use std::process::Stdio;
use std::time::Duration;

use tracing::{info, warn};

use super::{AdbController, Device};
use crate::config::EmulatorConfig;
use crate::error::DeviceError;

/// Console ports start at the ADB default and step by two, matching the
/// serials (`emulator-5554`, `emulator-5556`, ...) ADB assigns.
const BASE_CONSOLE_PORT: u16 = 5554;
const BASE_GRPC_PORT: u16 = 8554;

/// The device set a fleet of `count` instances will occupy.
pub fn fleet_devices(count: usize) -> Vec<Device> {
    (0..count)
        .map(|idx| {
            let console_port = BASE_CONSOLE_PORT + (idx as u16) * 2;
            Device {
                serial: format!("emulator-{}", console_port),
                console_port: Some(console_port),
                grpc_port: Some(BASE_GRPC_PORT + (idx as u16) * 2),
            }
        })
        .collect()
}

/// Launches the configured emulator fleet and blocks until every instance
/// is attached and booted.
pub async fn launch_fleet(
    adb: &AdbController,
    config: &EmulatorConfig,
) -> Result<Vec<Device>, DeviceError> {
    let devices = fleet_devices(config.num_of_emulators);

    for (idx, device) in devices.iter().enumerate() {
        let mut command = tokio::process::Command::new(&config.emulator_path);
        command
            .arg("-avd")
            .arg(format!("{}_{}", config.source_avd_name, idx))
            .args(["-no-snapshot-save", "-no-window", "-no-audio"])
            .arg("-port")
            .arg(device.console_port.unwrap_or(BASE_CONSOLE_PORT).to_string())
            .arg("-grpc")
            .arg(device.grpc_port.unwrap_or(BASE_GRPC_PORT).to_string())
            .stdout(Stdio::null());
        if let Ok(proxy) = std::env::var("HTTP_PROXY") {
            command.args(["-http-proxy", &proxy]);
        }
        command.spawn().map_err(DeviceError::Io)?;
        info!(serial = %device.serial, "Emulator instance launched");
    }

    wait_for_fleet(adb, &devices, config.boot_timeout_secs).await?;
    Ok(devices)
}

/// Polls `adb devices` and `sys.boot_completed` until the whole fleet is
/// ready, or the boot timeout expires for a straggler.
async fn wait_for_fleet(
    adb: &AdbController,
    devices: &[Device],
    timeout_secs: u64,
) -> Result<(), DeviceError> {
    let mut ready: Vec<bool> = vec![false; devices.len()];
    let mut waited = 0u64;

    loop {
        let attached = adb.list_devices().await?;
        for (idx, device) in devices.iter().enumerate() {
            if ready[idx] {
                continue;
            }
            let is_attached = attached.iter().any(|d| d.serial == device.serial);
            if is_attached && adb.boot_completed(device).await {
                ready[idx] = true;
                info!(serial = %device.serial, "Emulator ready");
            }
        }

        let ready_count = ready.iter().filter(|r| **r).count();
        info!(
            ready = ready_count,
            total = devices.len(),
            "Waiting for emulator fleet"
        );
        if ready_count == devices.len() {
            return Ok(());
        }
        if waited >= timeout_secs {
            let straggler = devices
                .iter()
                .zip(&ready)
                .find(|(_, r)| !**r)
                .map(|(d, _)| d.serial.clone())
                .unwrap_or_default();
            return Err(DeviceError::BootTimeout {
                serial: straggler,
                waited_secs: waited,
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += 1;
    }
}

/// Kills every emulator in the fleet. Failures are logged, not propagated:
/// teardown must not mask a successful run.
pub async fn terminate_fleet(adb: &AdbController, devices: &[Device]) {
    for device in devices {
        if !device.is_emulator() {
            continue;
        }
        if let Err(e) = adb.exec(&["-s", &device.serial, "emu", "kill"]).await {
            warn!(serial = %device.serial, error = %e, "Emulator kill failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_devices_ports() {
        let devices = fleet_devices(3);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[1].serial, "emulator-5556");
        assert_eq!(devices[2].serial, "emulator-5558");
        assert_eq!(devices[2].console_port, Some(5558));
        assert_eq!(devices[2].grpc_port, Some(8558));
    }

    #[test]
    fn test_fleet_devices_empty() {
        assert!(fleet_devices(0).is_empty());
    }
}
