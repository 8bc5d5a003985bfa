//! Capture the interface's current network state and take it over.
//!
//! Every step appends what it captured to the session record before it
//! changes anything, so the record never claims more than was captured.
//! If anything fails after the record exists (including an interrupt), the
//! partial capture is rolled back with [`restore_from`] before the error is
//! returned.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::error::SessionError;
use crate::interface::validate_interface_name;
use crate::interrupt::Interrupt;
use crate::ops::NetOps;
use crate::report::{PrepareReport, Step, StepFailure};
use crate::restore::restore_from;
use crate::session::SessionOptions;
use crate::store::{RecordKey, SessionRecord, SessionStore};

/// Takes `interface` over for a P2P session, recording everything needed to
/// undo it.
///
/// # Arguments
/// * `ops` - Host tooling, usually [`crate::SystemNetOps`]
/// * `options` - Record directory and restore settings
/// * `interface` - Wireless interface to prepare (e.g., "wlan0")
/// * `interrupt` - Checked between steps
///
/// # Returns
/// - `Ok(PrepareReport)` with the record path, what was captured (without
///   the secret) and any soft step failures
/// - `Err(SessionError::InvalidInterface)` before any command runs
/// - `Err(SessionError::P2pUnsupported)` before any record exists
/// - `Err(SessionError::Interrupted)` after the partial capture was rolled back
pub fn prepare<O: NetOps + ?Sized>(
    ops: &O,
    options: &SessionOptions,
    interface: &str,
    interrupt: &Interrupt,
) -> Result<PrepareReport> {
    validate_interface_name(interface)?;
    interrupt.check()?;

    let supported = ops
        .supports_p2p(interface)
        .with_context(|| format!("P2P capability probe failed for {}", interface))?;
    if !supported {
        return Err(SessionError::P2pUnsupported(interface.to_string()).into());
    }
    interrupt.check()?;

    let store = SessionStore::create(&options.record_dir)?;
    info!(target: "session", interface, record = %store.path().display(), "prepare_start");

    match capture_and_mutate(ops, &store, interface, interrupt) {
        Ok(report) => {
            info!(
                target: "session",
                interface,
                warnings = report.warnings.len(),
                "prepare_done"
            );
            Ok(report)
        }
        Err(e) => {
            warn!(target: "session", interface, error = %e, "prepare_aborted_rolling_back");
            match restore_from(ops, options, store) {
                Ok(rollback) if rollback.is_clean() => {}
                Ok(rollback) => warn!(
                    target: "session",
                    failed = rollback.failures().count(),
                    "rollback_incomplete"
                ),
                Err(rollback_err) => {
                    warn!(target: "session", error = %rollback_err, "rollback_failed")
                }
            }
            Err(e)
        }
    }
}

struct Capture<'a> {
    store: &'a SessionStore,
    record: SessionRecord,
    warnings: Vec<StepFailure>,
}

impl Capture<'_> {
    fn append(&self, key: RecordKey, value: &str) -> Result<()> {
        self.store.append(&key, value)
    }

    fn warn(&mut self, step: Step, error: impl std::fmt::Display) {
        let message = error.to_string();
        warn!(target: "session", %step, error = %message, "prepare_step_failed");
        self.warnings.push(StepFailure { step, message });
    }
}

fn capture_and_mutate<O: NetOps + ?Sized>(
    ops: &O,
    store: &SessionStore,
    interface: &str,
    interrupt: &Interrupt,
) -> Result<PrepareReport> {
    let iface = interface.to_string();
    let mut record = SessionRecord::default();
    record.interface = iface.clone();
    let mut cap = Capture {
        store,
        record,
        warnings: Vec::new(),
    };
    let mut secret_captured = false;

    cap.append(RecordKey::Interface, interface)?;

    // IPv4 snapshot
    interrupt.check()?;
    match ops.ipv4_address(interface) {
        Ok(Some(ip)) => {
            cap.append(RecordKey::InterfaceIp(iface.clone()), &ip)?;
            cap.record.prior_ip = Some(ip);
        }
        Ok(None) => cap.warn(Step::CaptureAddress, "no IPv4 address assigned"),
        Err(e) => cap.warn(Step::CaptureAddress, format!("{:#}", e)),
    }

    // NetworkManager
    interrupt.check()?;
    let managed = match ops.nm_is_managed(interface) {
        Ok(managed) => managed,
        Err(e) => {
            cap.warn(Step::CaptureNetworkManager, format!("{:#}", e));
            false
        }
    };

    if managed {
        cap.append(RecordKey::NmWasActive, "1")?;
        cap.record.nm_was_active = true;

        match ops.nm_active_ssid(interface) {
            Ok(Some(ssid)) => {
                cap.append(RecordKey::Ssid, &ssid)?;
                // The profile name may differ from the SSID ("HomeNet 1").
                let profile = match ops.nm_device_status(interface) {
                    Ok(status) => status.connection.unwrap_or_else(|| ssid.clone()),
                    Err(e) => {
                        debug!(target: "session", interface, error = %e, "profile_lookup_failed");
                        ssid.clone()
                    }
                };
                match ops.nm_secret(&profile) {
                    Ok(Some(mut secret)) => {
                        let written = cap.append(RecordKey::Password, &secret);
                        secret.zeroize();
                        written?;
                        secret_captured = true;
                    }
                    Ok(None) => debug!(target: "session", %profile, "no_stored_secret"),
                    Err(e) => cap.warn(Step::CaptureNetworkManager, format!("{:#}", e)),
                }
                cap.record.ssid = Some(ssid);
            }
            Ok(None) => debug!(target: "session", interface, "not_associated"),
            Err(e) => cap.warn(Step::CaptureNetworkManager, format!("{:#}", e)),
        }

        interrupt.check()?;
        if let Err(e) = ops.nm_set_managed(interface, false) {
            cap.warn(Step::ReleaseNetworkManager, format!("{:#}", e));
        }
    } else {
        cap.append(RecordKey::NmWasActive, "0")?;
    }

    // wpa_supplicant
    interrupt.check()?;
    match ops.find_wpa_supplicant(interface) {
        Ok(Some(wpa)) => {
            cap.append(RecordKey::WpaWasActive(iface.clone()), "1")?;
            cap.append(RecordKey::WpaPid(iface.clone()), &wpa.pid.to_string())?;
            if let Some(config) = &wpa.config {
                cap.append(RecordKey::WpaConfig(iface.clone()), &config.to_string_lossy())?;
            }
            cap.record.wpa_was_active = true;
            cap.record.wpa_pid = Some(wpa.pid);
            cap.record.wpa_config = wpa.config;

            if let Err(e) = ops.terminate(wpa.pid) {
                cap.warn(Step::StopSupplicant, format!("{:#}", e));
            }
        }
        Ok(None) => cap.append(RecordKey::WpaWasActive(iface.clone()), "0")?,
        Err(e) => cap.warn(Step::CaptureSupplicant, format!("{:#}", e)),
    }

    // Link
    interrupt.check()?;
    if let Err(e) = ops.set_link_up(interface) {
        cap.warn(Step::LinkUp, format!("{:#}", e));
    }

    interrupt.check()?;

    Ok(PrepareReport {
        interface: iface,
        record_path: store.path().to_path_buf(),
        captured: cap.record.redacted(),
        secret_captured,
        warnings: cap.warnings,
    })
}
