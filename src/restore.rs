//! Undo a prepared session from its record.
//!
//! Restoration is best-effort: each step runs even when an earlier one
//! failed, and every outcome lands in the [`RestoreReport`].

use anyhow::Result;
use std::thread;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::SessionError;
use crate::ops::NetOps;
use crate::report::{RestoreReport, Step};
use crate::session::SessionOptions;
use crate::store::SessionStore;

/// Restores the newest session record in the configured directory.
///
/// # Arguments
/// * `ops` - Host tooling, usually [`crate::SystemNetOps`]
/// * `options` - Record directory, fallback wpa_supplicant config and
///   reconnect settle delay
///
/// # Returns
/// - `Ok(RestoreReport)` once every step was attempted; check
///   [`RestoreReport::is_clean`]
/// - `Err(SessionError::NoSession)` without touching anything when no
///   record exists
pub fn restore<O: NetOps + ?Sized>(ops: &O, options: &SessionOptions) -> Result<RestoreReport> {
    let store = SessionStore::find_latest(&options.record_dir)?.ok_or_else(|| {
        SessionError::NoSession(options.record_dir.display().to_string())
    })?;
    restore_from(ops, options, store)
}

/// Restores from a specific record and destroys it afterwards.
///
/// A record that cannot be read or parsed is left in place and nothing is
/// changed.
pub fn restore_from<O: NetOps + ?Sized>(
    ops: &O,
    options: &SessionOptions,
    store: SessionStore,
) -> Result<RestoreReport> {
    let mut record = store.load()?;
    let iface = record.interface.clone();
    let mut report = RestoreReport::new(&iface, store.path().to_path_buf());

    info!(target: "session", interface = %iface, record = %store.path().display(), "restore_start");

    if record.nm_was_active {
        report.record(Step::ReenableNetworkManager, ops.nm_set_managed(&iface, true));

        if let Some(ssid) = record.ssid.clone() {
            let mut secret = record.secret.take();
            let connect = ops.nm_connect(&iface, &ssid, secret.as_deref());
            if let Some(secret) = secret.as_mut() {
                secret.zeroize();
            }
            let started = connect.is_ok();
            report.record(Step::Reconnect, connect);

            if started {
                if !options.reconnect_settle.is_zero() {
                    thread::sleep(options.reconnect_settle);
                }
                match ops.nm_device_status(&iface) {
                    Ok(status) => {
                        if status.is_connected() {
                            info!(target: "session", interface = %iface, ssid = %ssid, "reconnected");
                        } else {
                            warn!(
                                target: "session",
                                interface = %iface,
                                ssid = %ssid,
                                state = %status.state,
                                "reconnect_pending"
                            );
                        }
                        report.reconnect_state = Some(status.state);
                    }
                    Err(e) => warn!(target: "session", error = %e, "reconnect_status_unavailable"),
                }
            }
        }
    }
    record.scrub_secret();

    if record.wpa_was_active {
        let config = match &record.wpa_config {
            Some(path) if ops.file_exists(path) => path.clone(),
            Some(path) => {
                warn!(
                    target: "session",
                    missing = %path.display(),
                    fallback = %options.default_wpa_config.display(),
                    "wpa_config_missing"
                );
                options.default_wpa_config.clone()
            }
            None => options.default_wpa_config.clone(),
        };
        report.record(Step::RelaunchSupplicant, ops.start_wpa_supplicant(&iface, &config));
    }

    if let Some(ip) = &record.prior_ip {
        report.record(Step::RestoreAddress, ops.add_address(&iface, ip));
    }

    report.record(Step::DestroyRecord, store.destroy());

    info!(
        target: "session",
        interface = %iface,
        failed = report.failures().count(),
        "restore_done"
    );
    Ok(report)
}
