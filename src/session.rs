use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use crate::config::SessionConfig;
use crate::interrupt::Interrupt;
use crate::ops::NetOps;
use crate::prepare::prepare;
use crate::report::{PrepareReport, RestoreReport};
use crate::restore::restore_from;
use crate::store::SessionStore;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub record_dir: PathBuf,
    /// Used to relaunch wpa_supplicant when the recorded config is gone.
    pub default_wpa_config: PathBuf,
    /// Wait before checking whether the reconnect went through.
    pub reconnect_settle: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            record_dir: config.record_dir(),
            default_wpa_config: config.default_wpa_config.clone(),
            reconnect_settle: Duration::from_millis(config.reconnect_settle_ms),
        }
    }
}

/// A prepared interface that is restored exactly once: by [`finish`], or on
/// drop when the owner bails out early. [`keep`] hands the record over to a
/// later `restore` instead.
///
/// [`finish`]: PreparedSession::finish
/// [`keep`]: PreparedSession::keep
pub struct PreparedSession<O: NetOps> {
    ops: O,
    options: SessionOptions,
    store: Option<SessionStore>,
    report: PrepareReport,
}

impl<O: NetOps> PreparedSession<O> {
    pub fn begin(
        ops: O,
        options: SessionOptions,
        interface: &str,
        interrupt: &Interrupt,
    ) -> Result<Self> {
        let report = prepare(&ops, &options, interface, interrupt)?;
        let store = SessionStore::open(report.record_path.clone());
        Ok(Self {
            ops,
            options,
            store: Some(store),
            report,
        })
    }

    pub fn report(&self) -> &PrepareReport {
        &self.report
    }

    pub fn is_armed(&self) -> bool {
        self.store.is_some()
    }

    pub fn finish(mut self) -> Result<RestoreReport> {
        match self.store.take() {
            Some(store) => restore_from(&self.ops, &self.options, store),
            None => anyhow::bail!("Session for {} was already released", self.report.interface),
        }
    }

    /// Leaves the interface prepared and the record on disk.
    pub fn keep(mut self) -> PrepareReport {
        self.store.take();
        info!(
            target: "session",
            interface = %self.report.interface,
            record = %self.report.record_path.display(),
            "session_kept"
        );
        self.report.clone()
    }
}

impl<O: NetOps> Drop for PreparedSession<O> {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        match restore_from(&self.ops, &self.options, store) {
            Ok(report) if report.is_clean() => {
                info!(target: "session", interface = %report.interface, "restored_on_drop")
            }
            Ok(report) => error!(
                target: "session",
                interface = %report.interface,
                failed = report.failures().count(),
                "restore_on_drop_incomplete"
            ),
            Err(e) => error!(target: "session", error = %e, "restore_on_drop_failed"),
        }
    }
}
