use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::store::SessionRecord;

/// Individual steps of prepare and restore that can fail without aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CaptureAddress,
    CaptureNetworkManager,
    ReleaseNetworkManager,
    CaptureSupplicant,
    StopSupplicant,
    LinkUp,
    ReenableNetworkManager,
    Reconnect,
    RelaunchSupplicant,
    RestoreAddress,
    DestroyRecord,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::CaptureAddress => "capture IPv4 address",
            Step::CaptureNetworkManager => "query NetworkManager",
            Step::ReleaseNetworkManager => "release interface from NetworkManager",
            Step::CaptureSupplicant => "look up wpa_supplicant",
            Step::StopSupplicant => "stop wpa_supplicant",
            Step::LinkUp => "bring link up",
            Step::ReenableNetworkManager => "hand interface back to NetworkManager",
            Step::Reconnect => "reconnect to previous network",
            Step::RelaunchSupplicant => "relaunch wpa_supplicant",
            Step::RestoreAddress => "restore IPv4 address",
            Step::DestroyRecord => "destroy session record",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: Step,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub interface: String,
    pub record_path: PathBuf,
    /// What was captured, without the secret.
    pub captured: SessionRecord,
    pub secret_captured: bool,
    pub warnings: Vec<StepFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: Step,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub interface: String,
    pub record_path: PathBuf,
    pub steps: Vec<StepOutcome>,
    /// Device state observed after the reconnect settle delay.
    pub reconnect_state: Option<String>,
}

impl RestoreReport {
    pub fn new(interface: &str, record_path: PathBuf) -> Self {
        Self {
            interface: interface.to_string(),
            record_path,
            steps: Vec::new(),
            reconnect_state: None,
        }
    }

    pub fn record(&mut self, step: Step, result: anyhow::Result<()>) {
        let outcome = match result {
            Ok(()) => StepOutcome {
                step,
                ok: true,
                error: None,
            },
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(target: "session", %step, error = %message, "restore_step_failed");
                StepOutcome {
                    step,
                    ok: false,
                    error: Some(message),
                }
            }
        };
        self.steps.push(outcome);
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| !s.ok)
    }

    pub fn ran(&self, step: Step) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}
