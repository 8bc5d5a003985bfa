use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::error::SessionError;

const SYS_CLASS_NET: &str = "/sys/class/net";

lazy_static! {
    static ref INTERFACE_NAME: Regex = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
}

#[derive(Debug, Clone, Serialize)]
pub struct WifiInterface {
    pub name: String,
    pub state: String,
    pub phy: Option<String>,
}

/// Rejects any interface name outside `[A-Za-z0-9_]+`.
///
/// The name ends up in argument lists of `nmcli`, `ip`, `iw` and
/// `wpa_supplicant`, so this runs before any of them is invoked.
pub fn validate_interface_name(name: &str) -> Result<(), SessionError> {
    if INTERFACE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SessionError::InvalidInterface(name.to_string()))
    }
}

/// List all wireless interfaces on the system
pub fn list_wifi_interfaces() -> Result<Vec<WifiInterface>> {
    list_wifi_interfaces_in(Path::new(SYS_CLASS_NET))
}

fn list_wifi_interfaces_in(root: &Path) -> Result<Vec<WifiInterface>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?;

    let mut interfaces = Vec::new();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let dir = root.join(&name);

        if !dir.join("wireless").exists() && !dir.join("phy80211").exists() {
            continue;
        }

        let state = fs::read_to_string(dir.join("operstate"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        interfaces.push(WifiInterface {
            phy: read_phy_name(&dir),
            name,
            state,
        });
    }

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(interfaces)
}

fn read_phy_name(iface_dir: &Path) -> Option<String> {
    fs::read_to_string(iface_dir.join("phy80211").join("name"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Wireless PHY (e.g. "phy0") backing `interface`.
pub fn phy_for_interface(interface: &str) -> Result<String, SessionError> {
    let dir = Path::new(SYS_CLASS_NET).join(interface);
    if !dir.exists() {
        return Err(SessionError::InterfaceNotFound(interface.to_string()));
    }
    read_phy_name(&dir).ok_or_else(|| SessionError::InterfaceNotFound(interface.to_string()))
}

/// Scans `iw phy <phy> info` output for P2P among the supported interface
/// modes.
pub fn iw_info_supports_p2p(info: &str) -> bool {
    let mut in_modes = false;

    for line in info.lines() {
        let trimmed = line.trim();
        if trimmed == "Supported interface modes:" {
            in_modes = true;
            continue;
        }
        if !in_modes {
            continue;
        }
        match trimmed.strip_prefix("* ") {
            Some(mode) => {
                let mode = mode.trim();
                if mode == "P2P-client" || mode == "P2P-GO" {
                    return true;
                }
            }
            None => in_modes = false,
        }
    }

    false
}
