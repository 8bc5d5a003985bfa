//! External network tooling.
//!
//! Everything the session state machine does to the host goes through the
//! [`NetOps`] trait: NetworkManager via `nmcli`, the link via `ip`, the P2P
//! probe via `iw`, and `wpa_supplicant` via `/proc` and signals.
//! [`SystemNetOps`] is the real implementation.
//!
//! # Requirements
//!
//! - `nmcli`, `ip` and `iw` in PATH
//! - root privileges for every mutating call

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::error::SessionError;
use crate::interface;

/// How long a terminated `wpa_supplicant` gets to exit.
const TERMINATE_WAIT: Duration = Duration::from_secs(2);
const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// A running `wpa_supplicant` bound to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpaProcess {
    pub pid: u32,
    /// Value of `-c` on its command line, when present.
    pub config: Option<PathBuf>,
}

/// Connection status of a device as reported by NetworkManager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// The name of the network interface (e.g., "wlan0").
    pub interface: String,

    /// Raw state string from nmcli, e.g. "100 (connected)".
    pub state: String,

    /// The active connection profile, if connected.
    pub connection: Option<String>,

    /// Primary IPv4 address with prefix, e.g. "192.168.1.5/24".
    pub ip_address: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state.starts_with("100")
    }
}

pub trait NetOps {
    /// Whether the PHY behind `interface` offers P2P-client or P2P-GO mode.
    fn supports_p2p(&self, interface: &str) -> Result<bool>;

    /// Current IPv4 address with prefix length, if any.
    fn ipv4_address(&self, interface: &str) -> Result<Option<String>>;

    fn nm_is_managed(&self, interface: &str) -> Result<bool>;

    /// SSID of the network the interface is associated with.
    fn nm_active_ssid(&self, interface: &str) -> Result<Option<String>>;

    /// Stored pre-shared key of the connection profile named `profile`.
    fn nm_secret(&self, profile: &str) -> Result<Option<String>>;

    fn nm_set_managed(&self, interface: &str, managed: bool) -> Result<()>;

    /// Starts a connection attempt and returns without waiting for it.
    fn nm_connect(&self, interface: &str, ssid: &str, secret: Option<&str>) -> Result<()>;

    fn nm_device_status(&self, interface: &str) -> Result<ConnectionStatus>;

    fn find_wpa_supplicant(&self, interface: &str) -> Result<Option<WpaProcess>>;

    /// Sends SIGTERM and waits briefly for the process to go away.
    fn terminate(&self, pid: u32) -> Result<()>;

    fn start_wpa_supplicant(&self, interface: &str, config: &Path) -> Result<()>;

    fn set_link_up(&self, interface: &str) -> Result<()>;

    fn add_address(&self, interface: &str, cidr: &str) -> Result<()>;

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// [`NetOps`] backed by the host's command-line tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetOps;

/// Runs `tool` and returns stdout, turning a non-zero exit into
/// [`SessionError::CommandFailed`] carrying stderr (or stdout if empty).
fn run(tool: &'static str, args: &[&str]) -> Result<String> {
    debug!(target: "net", tool, ?args, "exec");

    let output = Command::new(tool)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute {}", tool))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(SessionError::CommandFailed { tool, message }.into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl NetOps for SystemNetOps {
    fn supports_p2p(&self, interface: &str) -> Result<bool> {
        let phy = interface::phy_for_interface(interface)?;
        let info = run("iw", &["phy", &phy, "info"])?;
        Ok(interface::iw_info_supports_p2p(&info))
    }

    /// # Command Executed
    /// ```bash
    /// ip -o -4 addr show dev <interface>
    /// ```
    fn ipv4_address(&self, interface: &str) -> Result<Option<String>> {
        let stdout = run("ip", &["-o", "-4", "addr", "show", "dev", interface])?;
        Ok(parse_ip_addr(&stdout))
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f DEVICE,STATE device
    /// ```
    fn nm_is_managed(&self, interface: &str) -> Result<bool> {
        let stdout = run("nmcli", &["-t", "-f", "DEVICE,STATE", "device"])?;
        Ok(parse_managed(&stdout, interface))
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f ACTIVE,SSID device wifi list ifname <interface> --rescan no
    /// ```
    fn nm_active_ssid(&self, interface: &str) -> Result<Option<String>> {
        let stdout = run(
            "nmcli",
            &["-t", "-f", "ACTIVE,SSID", "device", "wifi", "list", "ifname", interface, "--rescan", "no"],
        )?;
        Ok(parse_active_ssid(&stdout))
    }

    /// Reads the PSK of a connection profile. Output buffers are zeroized
    /// before returning.
    ///
    /// # Arguments
    /// * `profile` - Connection profile name, as in `GENERAL.CONNECTION`
    ///
    /// # Returns
    /// - `Ok(Some(psk))` when the profile stores a key
    /// - `Ok(None)` for open networks or profiles without a stored key
    /// - `Err(SessionError::CommandFailed)` if nmcli fails
    ///
    /// # Command Executed
    /// ```bash
    /// nmcli -s -g 802-11-wireless-security.psk connection show id <profile>
    /// ```
    fn nm_secret(&self, profile: &str) -> Result<Option<String>> {
        debug!(target: "net", tool = "nmcli", profile, "exec_secret_lookup");

        let mut output = Command::new("nmcli")
            .args(["-s", "-g", "802-11-wireless-security.psk", "connection", "show", "id", profile])
            .output()
            .context("Failed to execute nmcli")?;

        let result = if output.status.success() {
            let secret = String::from_utf8_lossy(&output.stdout);
            let secret = secret.trim_end_matches('\n');
            Ok((!secret.is_empty()).then(|| secret.to_string()))
        } else {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SessionError::CommandFailed { tool: "nmcli", message }.into())
        };

        output.stdout.zeroize();
        result
    }

    fn nm_set_managed(&self, interface: &str, managed: bool) -> Result<()> {
        let value = if managed { "yes" } else { "no" };
        run("nmcli", &["device", "set", interface, "managed", value])?;
        Ok(())
    }

    /// Spawns `nmcli device wifi connect` and hands the child to a reaper
    /// thread; the outcome is checked later through [`NetOps::nm_device_status`].
    fn nm_connect(&self, interface: &str, ssid: &str, secret: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("nmcli");
        cmd.args(["device", "wifi", "connect", ssid]);
        if let Some(secret) = secret {
            cmd.args(["password", secret]);
        }
        cmd.args(["ifname", interface])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().context("Failed to execute nmcli connect")?;
        thread::spawn(move || {
            if let Ok(status) = child.wait() {
                debug!(target: "net", %status, "nmcli_connect_exited");
            }
        });

        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t device show <interface>
    /// ```
    fn nm_device_status(&self, interface: &str) -> Result<ConnectionStatus> {
        let stdout = run("nmcli", &["-t", "device", "show", interface])?;
        Ok(parse_device_show(interface, &stdout))
    }

    fn find_wpa_supplicant(&self, interface: &str) -> Result<Option<WpaProcess>> {
        let own_pid = std::process::id();
        let entries = fs::read_dir("/proc").context("Failed to read /proc")?;

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // Processes can exit while we scan.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let args: Vec<String> = raw
                .split(|b| *b == 0)
                .filter(|a| !a.is_empty())
                .map(|a| String::from_utf8_lossy(a).to_string())
                .collect();

            if let Some(config) = match_wpa_cmdline(&args, interface) {
                return Ok(Some(WpaProcess { pid, config }));
            }
        }

        Ok(None)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let pid_t = libc::pid_t::try_from(pid).context("pid out of range")?;
        // SAFETY: kill(2) with a positive pid only signals that process.
        let rc = unsafe { libc::kill(pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to send SIGTERM to {}", pid));
        }

        let proc_dir = PathBuf::from(format!("/proc/{}", pid));
        let mut waited = Duration::ZERO;
        while proc_dir.exists() && waited < TERMINATE_WAIT {
            thread::sleep(TERMINATE_POLL);
            waited += TERMINATE_POLL;
        }

        if proc_dir.exists() {
            warn!(target: "net", pid, "process_still_running_after_sigterm");
            anyhow::bail!("Process {} did not exit after SIGTERM", pid);
        }
        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// wpa_supplicant -B -i <interface> -c <config>
    /// ```
    fn start_wpa_supplicant(&self, interface: &str, config: &Path) -> Result<()> {
        let config = config.to_string_lossy();
        run("wpa_supplicant", &["-B", "-i", interface, "-c", &config])?;
        Ok(())
    }

    fn set_link_up(&self, interface: &str) -> Result<()> {
        run("ip", &["link", "set", interface, "up"])?;
        Ok(())
    }

    /// An address that is already assigned counts as success.
    fn add_address(&self, interface: &str, cidr: &str) -> Result<()> {
        match run("ip", &["addr", "add", cidr, "dev", interface]) {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => {
                debug!(target: "net", interface, cidr, "address_already_present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether a systemd unit reports itself active.
///
/// # Command Executed
/// ```bash
/// systemctl is-active --quiet <unit>
/// ```
pub fn service_active(unit: &str) -> bool {
    Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Address from the first `inet` entry of `ip -o -4 addr show` output.
pub fn parse_ip_addr(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        tokens.next().map(str::to_string)
    })
}

/// Any state other than "unmanaged" means NetworkManager owns the device.
pub fn parse_managed(stdout: &str, interface: &str) -> bool {
    stdout.lines().any(|line| {
        let parts: Vec<&str> = line.splitn(2, ':').collect();
        parts.len() == 2 && parts[0] == interface && parts[1] != "unmanaged"
    })
}

/// SSID from the `yes:<ssid>` row of terse `ACTIVE,SSID` output.
pub fn parse_active_ssid(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let ssid = line.strip_prefix("yes:")?;
        // Terse mode escapes ':' and '\' in values.
        let ssid = ssid.replace("\\:", ":").replace("\\\\", "\\");
        if ssid.is_empty() { None } else { Some(ssid) }
    })
}

/// Parses `nmcli -t device show` output (KEY:VALUE per line).
pub fn parse_device_show(interface: &str, stdout: &str) -> ConnectionStatus {
    let mut status = ConnectionStatus {
        interface: interface.to_string(),
        state: "unknown".to_string(),
        connection: None,
        ip_address: None,
    };

    for line in stdout.lines() {
        // Split on first colon only (value might contain colons)
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key {
            "GENERAL.STATE" => status.state = value.to_string(),
            "GENERAL.CONNECTION" => {
                if !value.is_empty() && value != "--" {
                    status.connection = Some(value.to_string());
                }
            }
            "IP4.ADDRESS[1]" => status.ip_address = Some(value.to_string()),
            _ => {}
        }
    }

    status
}

/// Returns `Some(config)` when `args` is a `wpa_supplicant` command line
/// bound to `interface` via `-i <if>` or `-i<if>`.
///
/// A daemon serving several interfaces separates them with `-N`; only the
/// `-c` of the section that names `interface` is taken.
pub fn match_wpa_cmdline(args: &[String], interface: &str) -> Option<Option<PathBuf>> {
    let program = args.first()?;
    let name = Path::new(program).file_name()?.to_str()?;
    if !name.starts_with("wpa_supplicant") {
        return None;
    }

    args[1..]
        .split(|arg| arg == "-N")
        .find_map(|section| match_wpa_section(section, interface))
}

fn match_wpa_section(section: &[String], interface: &str) -> Option<Option<PathBuf>> {
    let mut bound = false;
    let mut config = None;
    let mut iter = section.iter();

    while let Some(arg) = iter.next() {
        if arg == "-i" {
            if iter.next().is_some_and(|v| v == interface) {
                bound = true;
            }
        } else if let Some(value) = arg.strip_prefix("-i") {
            if value == interface {
                bound = true;
            }
        } else if arg == "-c" {
            if let Some(value) = iter.next() {
                config.get_or_insert_with(|| PathBuf::from(value));
            }
        } else if let Some(value) = arg.strip_prefix("-c") {
            if !value.is_empty() {
                config.get_or_insert_with(|| PathBuf::from(value));
            }
        }
    }

    bound.then_some(config)
}
