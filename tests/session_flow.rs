use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use wfd_session::ops::{ConnectionStatus, WpaProcess};
use wfd_session::store::RECORD_PREFIX;
use wfd_session::{
    prepare, restore, Interrupt, NetOps, PreparedSession, SessionError, SessionOptions,
    SessionStore, Step,
};

const WPA_CONF: &str = "/etc/wpa_supplicant/wpa_supplicant.conf";
const FALLBACK_CONF: &str = "/etc/wpa_supplicant/fallback.conf";

#[derive(Debug, Clone, Default)]
struct HostState {
    p2p: bool,
    managed: bool,
    ssid: Option<String>,
    /// NetworkManager profile for `ssid`, which need not share its name.
    profile: Option<String>,
    secret: Option<String>,
    wpa: Option<WpaProcess>,
    ip: Option<String>,
    link_up: bool,
    connected_to: Option<String>,
    connect_secret: Option<String>,
}

#[derive(Default)]
struct Inner {
    host: HostState,
    calls: Vec<String>,
    /// Record contents at the moment of each mutating call.
    snapshots: Vec<(String, String)>,
}

/// In-memory host that behaves like NetworkManager, `ip` and
/// `wpa_supplicant` for one interface.
#[derive(Clone)]
struct FakeHost {
    inner: Rc<RefCell<Inner>>,
    record_dir: PathBuf,
    existing_files: Vec<PathBuf>,
    fail_wpa_lookup: bool,
    /// Mutating calls that fail after being logged.
    fail_on: HashSet<&'static str>,
    interrupt_on: Option<(&'static str, Interrupt, i32)>,
}

impl FakeHost {
    fn new(record_dir: &Path, host: HostState) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                host,
                ..Inner::default()
            })),
            record_dir: record_dir.to_path_buf(),
            existing_files: vec![PathBuf::from(WPA_CONF), PathBuf::from(FALLBACK_CONF)],
            fail_wpa_lookup: false,
            fail_on: HashSet::new(),
            interrupt_on: None,
        }
    }

    fn host(&self) -> HostState {
        self.inner.borrow().host.clone()
    }

    fn calls(&self) -> Vec<String> {
        self.inner.borrow().calls.clone()
    }

    fn count(&self, call: &str) -> usize {
        self.inner.borrow().calls.iter().filter(|c| *c == call).count()
    }

    fn snapshot_for(&self, call: &str) -> String {
        self.inner
            .borrow()
            .snapshots
            .iter()
            .find(|(c, _)| c == call)
            .map(|(_, text)| text.clone())
            .unwrap_or_else(|| panic!("{call} was never called"))
    }

    fn query(&self, call: String) {
        self.inner.borrow_mut().calls.push(call);
    }

    fn mutate(&self, call: String) -> Result<()> {
        let text = record_text(&self.record_dir);
        {
            let mut inner = self.inner.borrow_mut();
            inner.calls.push(call.clone());
            inner.snapshots.push((call.clone(), text));
        }
        if let Some((trigger, interrupt, signo)) = &self.interrupt_on {
            if call == *trigger {
                interrupt.raise(*signo);
            }
        }
        if self.fail_on.contains(call.as_str()) {
            anyhow::bail!("{call} failed");
        }
        Ok(())
    }
}

impl NetOps for FakeHost {
    fn supports_p2p(&self, interface: &str) -> Result<bool> {
        self.query(format!("supports_p2p({interface})"));
        Ok(self.inner.borrow().host.p2p)
    }

    fn ipv4_address(&self, interface: &str) -> Result<Option<String>> {
        self.query(format!("ipv4_address({interface})"));
        Ok(self.inner.borrow().host.ip.clone())
    }

    fn nm_is_managed(&self, interface: &str) -> Result<bool> {
        self.query(format!("nm_is_managed({interface})"));
        Ok(self.inner.borrow().host.managed)
    }

    fn nm_active_ssid(&self, interface: &str) -> Result<Option<String>> {
        self.query(format!("nm_active_ssid({interface})"));
        let inner = self.inner.borrow();
        Ok(if inner.host.managed { inner.host.ssid.clone() } else { None })
    }

    fn nm_secret(&self, profile: &str) -> Result<Option<String>> {
        self.query(format!("nm_secret({profile})"));
        let inner = self.inner.borrow();
        if inner.host.profile.as_deref() == Some(profile) {
            Ok(inner.host.secret.clone())
        } else {
            anyhow::bail!("Error: {profile} - no such connection profile.")
        }
    }

    fn nm_set_managed(&self, interface: &str, managed: bool) -> Result<()> {
        self.mutate(format!("nm_set_managed({interface},{managed})"))?;
        let mut inner = self.inner.borrow_mut();
        inner.host.managed = managed;
        if !managed {
            // NetworkManager flushes the addresses of a released device.
            inner.host.ip = None;
            inner.host.connected_to = None;
        }
        Ok(())
    }

    fn nm_connect(&self, interface: &str, ssid: &str, secret: Option<&str>) -> Result<()> {
        self.mutate(format!("nm_connect({interface},{ssid})"))?;
        let mut inner = self.inner.borrow_mut();
        inner.host.connected_to = Some(ssid.to_string());
        inner.host.connect_secret = secret.map(str::to_string);
        Ok(())
    }

    fn nm_device_status(&self, interface: &str) -> Result<ConnectionStatus> {
        self.query(format!("nm_device_status({interface})"));
        let inner = self.inner.borrow();
        let state = match inner.host.connected_to {
            Some(_) => "100 (connected)",
            None => "30 (disconnected)",
        };
        Ok(ConnectionStatus {
            interface: interface.to_string(),
            state: state.to_string(),
            connection: inner
                .host
                .connected_to
                .as_ref()
                .and(inner.host.profile.clone()),
            ip_address: inner.host.ip.clone(),
        })
    }

    fn find_wpa_supplicant(&self, interface: &str) -> Result<Option<WpaProcess>> {
        self.query(format!("find_wpa_supplicant({interface})"));
        if self.fail_wpa_lookup {
            anyhow::bail!("Failed to read /proc");
        }
        Ok(self.inner.borrow().host.wpa.clone())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.mutate(format!("terminate({pid})"))?;
        let mut inner = self.inner.borrow_mut();
        if inner.host.wpa.as_ref().is_some_and(|w| w.pid == pid) {
            inner.host.wpa = None;
        }
        Ok(())
    }

    fn start_wpa_supplicant(&self, interface: &str, config: &Path) -> Result<()> {
        self.mutate(format!("start_wpa_supplicant({interface},{})", config.display()))?;
        self.inner.borrow_mut().host.wpa = Some(WpaProcess {
            pid: 5000,
            config: Some(config.to_path_buf()),
        });
        Ok(())
    }

    fn set_link_up(&self, interface: &str) -> Result<()> {
        self.mutate(format!("set_link_up({interface})"))?;
        self.inner.borrow_mut().host.link_up = true;
        Ok(())
    }

    fn add_address(&self, interface: &str, cidr: &str) -> Result<()> {
        self.mutate(format!("add_address({interface},{cidr})"))?;
        self.inner.borrow_mut().host.ip = Some(cidr.to_string());
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.existing_files.iter().any(|p| p == path)
    }
}

fn record_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with(RECORD_PREFIX))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default()
}

fn record_text(dir: &Path) -> String {
    record_files(dir)
        .first()
        .and_then(|p| fs::read_to_string(p).ok())
        .unwrap_or_default()
}

fn options(dir: &Path) -> SessionOptions {
    SessionOptions {
        record_dir: dir.to_path_buf(),
        default_wpa_config: PathBuf::from(FALLBACK_CONF),
        reconnect_settle: Duration::ZERO,
    }
}

fn home_network() -> HostState {
    HostState {
        p2p: true,
        managed: true,
        ssid: Some("HomeNet".to_string()),
        profile: Some("HomeNet 1".to_string()),
        secret: Some("s3cr3t".to_string()),
        wpa: Some(WpaProcess {
            pid: 4242,
            config: Some(PathBuf::from(WPA_CONF)),
        }),
        ip: Some("192.168.1.5/24".to_string()),
        connected_to: Some("HomeNet".to_string()),
        ..HostState::default()
    }
}

fn session_error(err: &anyhow::Error) -> Option<&SessionError> {
    err.downcast_ref::<SessionError>()
}

#[test]
fn prepare_records_full_state() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    let report = prepare(&host, &options(dir.path()), "wlan0", &Interrupt::new()).unwrap();

    let files = record_files(dir.path());
    assert_eq!(files, vec![report.record_path.clone()]);
    let mode = fs::metadata(&files[0]).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let text = fs::read_to_string(&files[0]).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort_unstable();
    assert_eq!(
        lines,
        vec![
            "INTERFACE=wlan0",
            "INTERFACE_IP_wlan0=192.168.1.5/24",
            "NM_WAS_ACTIVE=1",
            "PASSWORD=s3cr3t",
            "SSID=HomeNet",
            "WPA_CONFIG_wlan0=/etc/wpa_supplicant/wpa_supplicant.conf",
            "WPA_PID_wlan0=4242",
            "WPA_WAS_ACTIVE_wlan0=1",
        ]
    );

    let state = host.host();
    assert!(!state.managed);
    assert!(state.wpa.is_none());
    assert!(state.link_up);

    assert!(report.secret_captured);
    assert_eq!(host.count("nm_secret(HomeNet 1)"), 1);
    assert!(report.warnings.is_empty());
    assert_eq!(report.captured.secret, None);
    assert_eq!(report.captured.wpa_pid, Some(4242));
    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains("s3cr3t"));
}

#[test]
fn state_is_recorded_before_each_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    prepare(&host, &options(dir.path()), "wlan0", &Interrupt::new()).unwrap();

    let before_release = host.snapshot_for("nm_set_managed(wlan0,false)");
    for line in ["INTERFACE=wlan0", "NM_WAS_ACTIVE=1", "SSID=HomeNet", "PASSWORD=s3cr3t"] {
        assert!(before_release.contains(line), "{line} missing before release");
    }

    let before_kill = host.snapshot_for("terminate(4242)");
    assert!(before_kill.contains("WPA_WAS_ACTIVE_wlan0=1"));
    assert!(before_kill.contains("WPA_PID_wlan0=4242"));
}

#[test]
fn restore_brings_back_previous_network() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());
    let opts = options(dir.path());

    prepare(&host, &opts, "wlan0", &Interrupt::new()).unwrap();
    let report = restore(&host, &opts).unwrap();

    assert!(report.is_clean(), "{:?}", report.steps);
    assert_eq!(report.reconnect_state.as_deref(), Some("100 (connected)"));
    assert!(record_files(dir.path()).is_empty());

    let state = host.host();
    assert!(state.managed);
    assert_eq!(state.connected_to.as_deref(), Some("HomeNet"));
    assert_eq!(state.connect_secret.as_deref(), Some("s3cr3t"));
    assert_eq!(state.ip.as_deref(), Some("192.168.1.5/24"));
    assert_eq!(
        state.wpa.and_then(|w| w.config),
        Some(PathBuf::from(WPA_CONF))
    );

    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains("s3cr3t"));
}

#[test]
fn every_combination_round_trips() {
    for mask in 0..8u8 {
        let managed = mask & 1 != 0;
        let wpa_running = mask & 2 != 0;
        let has_ip = mask & 4 != 0;

        let dir = tempfile::tempdir().unwrap();
        let initial = HostState {
            p2p: true,
            managed,
            ssid: managed.then(|| "HomeNet".to_string()),
            profile: managed.then(|| "HomeNet".to_string()),
            secret: managed.then(|| "s3cr3t".to_string()),
            wpa: wpa_running.then(|| WpaProcess {
                pid: 4242,
                config: Some(PathBuf::from(WPA_CONF)),
            }),
            ip: has_ip.then(|| "10.0.0.7/24".to_string()),
            connected_to: managed.then(|| "HomeNet".to_string()),
            ..HostState::default()
        };
        let host = FakeHost::new(dir.path(), initial);
        let opts = options(dir.path());

        prepare(&host, &opts, "wlan0", &Interrupt::new()).unwrap();
        let report = restore(&host, &opts).unwrap();
        assert!(report.is_clean(), "mask {mask}: {:?}", report.steps);

        let state = host.host();
        assert_eq!(state.managed, managed, "mask {mask}");
        assert_eq!(state.wpa.is_some(), wpa_running, "mask {mask}");
        assert_eq!(state.ip.is_some(), has_ip, "mask {mask}");
        assert_eq!(report.ran(Step::ReenableNetworkManager), managed, "mask {mask}");
        assert_eq!(report.ran(Step::RelaunchSupplicant), wpa_running, "mask {mask}");
        assert_eq!(report.ran(Step::RestoreAddress), has_ip, "mask {mask}");
        assert!(record_files(dir.path()).is_empty(), "mask {mask}");
    }
}

#[test]
fn restore_without_record_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    let err = restore(&host, &options(dir.path())).unwrap_err();
    assert!(matches!(session_error(&err), Some(SessionError::NoSession(_))));
    assert!(host.calls().is_empty());
}

#[test]
fn invalid_interface_runs_no_commands() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    for name in ["wlan0; reboot", "wlan0 -c /tmp/x", ""] {
        let err = prepare(&host, &options(dir.path()), name, &Interrupt::new()).unwrap_err();
        assert!(matches!(session_error(&err), Some(SessionError::InvalidInterface(_))));
    }
    assert!(host.calls().is_empty());
    assert!(record_files(dir.path()).is_empty());
}

#[test]
fn unsupported_interface_creates_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(
        dir.path(),
        HostState {
            p2p: false,
            ..home_network()
        },
    );

    let err = prepare(&host, &options(dir.path()), "wlan0", &Interrupt::new()).unwrap_err();
    assert!(matches!(session_error(&err), Some(SessionError::P2pUnsupported(_))));
    assert_eq!(host.calls(), vec!["supports_p2p(wlan0)".to_string()]);
    assert!(record_files(dir.path()).is_empty());
    assert!(host.host().managed);
}

#[test]
fn interrupt_mid_prepare_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let interrupt = Interrupt::new();
    let mut host = FakeHost::new(dir.path(), home_network());
    host.interrupt_on = Some(("nm_set_managed(wlan0,false)", interrupt.clone(), libc::SIGINT));

    let err = prepare(&host, &options(dir.path()), "wlan0", &interrupt).unwrap_err();
    assert!(matches!(
        session_error(&err),
        Some(SessionError::Interrupted(s)) if *s == libc::SIGINT
    ));

    let state = host.host();
    assert!(state.managed);
    assert_eq!(state.connected_to.as_deref(), Some("HomeNet"));
    assert_eq!(state.ip.as_deref(), Some("192.168.1.5/24"));
    // Interrupted before the supplicant was looked up.
    assert_eq!(host.count("terminate(4242)"), 0);
    assert_eq!(state.wpa.map(|w| w.pid), Some(4242));
    assert!(record_files(dir.path()).is_empty());
}

#[test]
fn failed_supplicant_lookup_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = FakeHost::new(dir.path(), home_network());
    host.fail_wpa_lookup = true;
    let opts = options(dir.path());

    let report = prepare(&host, &opts, "wlan0", &Interrupt::new()).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].step, Step::CaptureSupplicant);
    assert!(!record_text(dir.path()).contains("WPA_WAS_ACTIVE"));

    let restored = restore(&host, &opts).unwrap();
    assert!(!restored.ran(Step::RelaunchSupplicant));
}

#[test]
fn missing_supplicant_config_falls_back_to_default() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = FakeHost::new(dir.path(), home_network());
    host.existing_files = vec![PathBuf::from(FALLBACK_CONF)];
    let opts = options(dir.path());

    prepare(&host, &opts, "wlan0", &Interrupt::new()).unwrap();
    restore(&host, &opts).unwrap();

    assert_eq!(
        host.count(&format!("start_wpa_supplicant(wlan0,{FALLBACK_CONF})")),
        1
    );
}

#[test]
fn malformed_record_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());
    let store = SessionStore::create(dir.path()).unwrap();
    fs::write(store.path(), "INTERFACE=wlan0\n$(reboot)\n").unwrap();

    let err = restore(&host, &options(dir.path())).unwrap_err();
    assert!(matches!(session_error(&err), Some(SessionError::MalformedRecord { .. })));
    assert!(store.path().exists());
    assert!(host.calls().is_empty());
}

#[test]
fn dropped_session_restores_once() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    let session =
        PreparedSession::begin(host.clone(), options(dir.path()), "wlan0", &Interrupt::new())
            .unwrap();
    assert!(session.is_armed());
    assert!(!host.host().managed);
    drop(session);

    assert!(host.host().managed);
    assert_eq!(host.count("nm_set_managed(wlan0,true)"), 1);
    assert!(record_files(dir.path()).is_empty());
}

#[test]
fn finished_session_is_not_restored_again() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());

    let session =
        PreparedSession::begin(host.clone(), options(dir.path()), "wlan0", &Interrupt::new())
            .unwrap();
    let report = session.finish().unwrap();

    assert!(report.is_clean());
    assert_eq!(host.count("nm_set_managed(wlan0,true)"), 1);
    assert_eq!(host.count("add_address(wlan0,192.168.1.5/24)"), 1);
}

#[test]
fn kept_session_is_restored_later() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path(), home_network());
    let opts = options(dir.path());

    let session =
        PreparedSession::begin(host.clone(), opts.clone(), "wlan0", &Interrupt::new()).unwrap();
    let kept = session.keep();

    assert!(kept.record_path.exists());
    assert!(!host.host().managed);

    let report = restore(&host, &opts).unwrap();
    assert_eq!(report.record_path, kept.record_path);
    assert!(host.host().managed);
    assert!(!kept.record_path.exists());
}

#[test]
fn restore_continues_after_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = FakeHost::new(dir.path(), home_network());
    let opts = options(dir.path());

    prepare(&host, &opts, "wlan0", &Interrupt::new()).unwrap();
    host.fail_on.insert("nm_set_managed(wlan0,true)");
    let report = restore(&host, &opts).unwrap();

    assert!(!report.is_clean());
    let failed: Vec<Step> = report.failures().map(|o| o.step).collect();
    assert_eq!(failed, vec![Step::ReenableNetworkManager]);

    assert_eq!(host.count(&format!("start_wpa_supplicant(wlan0,{WPA_CONF})")), 1);
    assert_eq!(host.count("add_address(wlan0,192.168.1.5/24)"), 1);
    assert!(report.ran(Step::DestroyRecord));
    assert!(record_files(dir.path()).is_empty());

    let state = host.host();
    assert!(!state.managed);
    assert_eq!(state.ip.as_deref(), Some("192.168.1.5/24"));
    assert!(state.wpa.is_some());
}

#[test]
fn failed_stop_and_link_up_are_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = FakeHost::new(dir.path(), home_network());
    host.fail_on.insert("terminate(4242)");
    host.fail_on.insert("set_link_up(wlan0)");

    let report = prepare(&host, &options(dir.path()), "wlan0", &Interrupt::new()).unwrap();

    let steps: Vec<Step> = report.warnings.iter().map(|w| w.step).collect();
    assert_eq!(steps, vec![Step::StopSupplicant, Step::LinkUp]);
    assert!(report.captured.wpa_was_active);
    assert_eq!(record_files(dir.path()), vec![report.record_path.clone()]);
    assert!(record_text(dir.path()).contains("WPA_PID_wlan0=4242"));
    assert!(!host.host().managed);
}

#[test]
fn secret_lookup_falls_back_to_ssid() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(
        dir.path(),
        HostState {
            profile: Some("HomeNet".to_string()),
            connected_to: None,
            ..home_network()
        },
    );

    let report = prepare(&host, &options(dir.path()), "wlan0", &Interrupt::new()).unwrap();

    assert!(report.secret_captured);
    assert_eq!(host.count("nm_secret(HomeNet)"), 1);
}
