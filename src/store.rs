//! On-disk undo record for a prepared session.
//!
//! A record is a small `KEY=VALUE` file named `wfd-session.<random>` in the
//! session directory, readable only by its owner. It is written before the
//! interface is touched and appended to as each piece of state is captured,
//! so whatever is in the file has really been captured.
//!
//! ```text
//! INTERFACE=wlan0
//! INTERFACE_IP_wlan0=192.168.1.5/24
//! NM_WAS_ACTIVE=1
//! SSID=HomeNet
//! PASSWORD=s3cr3t
//! WPA_WAS_ACTIVE_wlan0=1
//! WPA_PID_wlan0=4242
//! WPA_CONFIG_wlan0=/etc/wpa_supplicant/wpa_supplicant.conf
//! ```
//!
//! Loading is a strict parse: unknown keys, malformed lines and per-interface
//! keys for another interface are errors. When a key repeats, the last
//! occurrence wins.

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::error::SessionError;
use crate::interface::validate_interface_name;

pub const RECORD_PREFIX: &str = "wfd-session.";
const SUFFIX_LEN: usize = 12;
const CREATE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Interface,
    NmWasActive,
    Ssid,
    Password,
    WpaWasActive(String),
    WpaPid(String),
    WpaConfig(String),
    InterfaceIp(String),
}

impl RecordKey {
    fn parse(key: &str) -> Option<Self> {
        let namespaced: [(&str, fn(String) -> RecordKey); 4] = [
            ("WPA_WAS_ACTIVE_", RecordKey::WpaWasActive),
            ("WPA_PID_", RecordKey::WpaPid),
            ("WPA_CONFIG_", RecordKey::WpaConfig),
            ("INTERFACE_IP_", RecordKey::InterfaceIp),
        ];

        match key {
            "INTERFACE" => return Some(RecordKey::Interface),
            "NM_WAS_ACTIVE" => return Some(RecordKey::NmWasActive),
            "SSID" => return Some(RecordKey::Ssid),
            "PASSWORD" => return Some(RecordKey::Password),
            _ => {}
        }

        for (prefix, make) in namespaced {
            if let Some(iface) = key.strip_prefix(prefix) {
                if validate_interface_name(iface).is_ok() {
                    return Some(make(iface.to_string()));
                }
                return None;
            }
        }

        None
    }

    fn namespace(&self) -> Option<&str> {
        match self {
            RecordKey::WpaWasActive(i)
            | RecordKey::WpaPid(i)
            | RecordKey::WpaConfig(i)
            | RecordKey::InterfaceIp(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Interface => f.write_str("INTERFACE"),
            RecordKey::NmWasActive => f.write_str("NM_WAS_ACTIVE"),
            RecordKey::Ssid => f.write_str("SSID"),
            RecordKey::Password => f.write_str("PASSWORD"),
            RecordKey::WpaWasActive(i) => write!(f, "WPA_WAS_ACTIVE_{}", i),
            RecordKey::WpaPid(i) => write!(f, "WPA_PID_{}", i),
            RecordKey::WpaConfig(i) => write!(f, "WPA_CONFIG_{}", i),
            RecordKey::InterfaceIp(i) => write!(f, "INTERFACE_IP_{}", i),
        }
    }
}

/// Network state captured before the interface was taken over.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub interface: String,
    pub nm_was_active: bool,
    pub ssid: Option<String>,
    /// Never serialized; zeroized on drop.
    #[serde(skip)]
    pub secret: Option<String>,
    pub wpa_was_active: bool,
    pub wpa_pid: Option<u32>,
    pub wpa_config: Option<PathBuf>,
    pub prior_ip: Option<String>,
}

impl SessionRecord {
    /// Copy of the record without the secret.
    pub fn redacted(&self) -> SessionRecord {
        let mut copy = self.clone();
        copy.scrub_secret();
        copy
    }

    pub fn scrub_secret(&mut self) {
        if let Some(mut secret) = self.secret.take() {
            secret.zeroize();
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("interface", &self.interface)
            .field("nm_was_active", &self.nm_was_active)
            .field("ssid", &self.ssid)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("wpa_was_active", &self.wpa_was_active)
            .field("wpa_pid", &self.wpa_pid)
            .field("wpa_config", &self.wpa_config)
            .field("prior_ip", &self.prior_ip)
            .finish()
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        self.scrub_secret();
    }
}

#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Creates a new, empty record in `dir` with owner-only permissions.
    ///
    /// There is no fallback: without a record the session must not start.
    pub fn create(dir: &Path) -> Result<Self> {
        for _ in 0..CREATE_ATTEMPTS {
            let suffix: String = OsRng
                .sample_iter(&Alphanumeric)
                .take(SUFFIX_LEN)
                .map(char::from)
                .collect();
            let path = dir.join(format!("{}{}", RECORD_PREFIX, suffix));

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    file.set_permissions(fs::Permissions::from_mode(0o600))
                        .with_context(|| format!("Failed to restrict {}", path.display()))?;
                    debug!(target: "session", path = %path.display(), "record_created");
                    return Ok(SessionStore { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create session record in {}", dir.display())
                    });
                }
            }
        }

        anyhow::bail!(
            "Failed to create session record in {}: no free name after {} attempts",
            dir.display(),
            CREATE_ATTEMPTS
        )
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    /// All records in `dir` owned by the current user, oldest first.
    pub fn list(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", dir.display()));
            }
        };

        // SAFETY: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };
        let mut records = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(RECORD_PREFIX) {
                continue;
            }
            let path = entry.path();
            // symlink_metadata so a planted link is never followed.
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if !meta.file_type().is_file() || meta.uid() != euid {
                warn!(target: "session", path = %path.display(), "record_ignored_foreign");
                continue;
            }
            records.push((meta.modified().ok(), path));
        }

        records.sort();
        Ok(records.into_iter().map(|(_, path)| path).collect())
    }

    /// Most recent record in `dir`, if any.
    pub fn find_latest(dir: &Path) -> Result<Option<Self>> {
        let mut records = Self::list(dir)?;
        if records.len() > 1 {
            warn!(
                target: "session",
                count = records.len(),
                "multiple_records_found_using_newest"
            );
        }
        Ok(records.pop().map(SessionStore::open))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one `KEY=VALUE` line and syncs it to disk.
    ///
    /// # Returns
    /// - `Ok(())` once the line is durable
    /// - `Err(SessionError::InvalidRecordValue)` if `value` contains a line
    ///   break; nothing is written
    pub fn append(&self, key: &RecordKey, value: &str) -> Result<()> {
        if value.contains('\n') || value.contains('\r') {
            return Err(SessionError::InvalidRecordValue(key.to_string()).into());
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let mut line = format!("{}={}\n", key, value);
        let written = file.write_all(line.as_bytes()).and_then(|_| file.sync_data());
        line.zeroize();

        written.with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Reads and strictly parses the record.
    ///
    /// # Returns
    /// - `Ok(SessionRecord)`, secret included
    /// - `Err(SessionError::MalformedRecord)` for unknown keys, lines that are
    ///   not `KEY=VALUE`, bad flags or pids, or keys of another interface
    pub fn load(&self) -> Result<SessionRecord> {
        let mut content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let record = parse_record(&self.path, &content);
        content.zeroize();
        Ok(record?)
    }

    /// Overwrites the record with zeros and removes it, falling back to a
    /// plain removal when the overwrite fails.
    pub fn destroy(self) -> Result<()> {
        if let Err(e) = overwrite_with_zeros(&self.path) {
            warn!(
                target: "session",
                path = %self.path.display(),
                error = %e,
                "record_overwrite_failed"
            );
        }

        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        debug!(target: "session", path = %self.path.display(), "record_destroyed");
        Ok(())
    }
}

fn overwrite_with_zeros(path: &Path) -> std::io::Result<()> {
    let len = fs::metadata(path)?.len() as usize;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()
}

fn parse_record(path: &Path, content: &str) -> Result<SessionRecord, SessionError> {
    let malformed = |line: usize, reason: String| SessionError::MalformedRecord {
        path: path.display().to_string(),
        line,
        reason,
    };

    let mut entries = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| malformed(line_no, "expected KEY=VALUE".to_string()))?;
        let key = RecordKey::parse(key)
            .ok_or_else(|| malformed(line_no, format!("unrecognized key '{}'", key)))?;
        entries.push((line_no, key, value));
    }

    let interface = entries
        .iter()
        .rev()
        .find(|(_, key, _)| *key == RecordKey::Interface)
        .map(|(_, _, value)| value.to_string())
        .ok_or_else(|| malformed(0, "missing INTERFACE".to_string()))?;

    validate_interface_name(&interface)
        .map_err(|_| malformed(0, format!("invalid interface '{}'", interface)))?;

    let flag = |line: usize, value: &str| match value {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(malformed(line, format!("expected 0 or 1, got '{}'", other))),
    };

    let mut record = SessionRecord::default();
    record.interface = interface.clone();

    for (line_no, key, value) in entries {
        if let Some(ns) = key.namespace() {
            if ns != interface {
                return Err(malformed(
                    line_no,
                    format!("{} does not belong to interface {}", key, interface),
                ));
            }
        }

        match key {
            RecordKey::Interface => {}
            RecordKey::NmWasActive => record.nm_was_active = flag(line_no, value)?,
            RecordKey::Ssid => record.ssid = non_empty(value),
            RecordKey::Password => {
                record.scrub_secret();
                record.secret = non_empty(value);
            }
            RecordKey::WpaWasActive(_) => record.wpa_was_active = flag(line_no, value)?,
            RecordKey::WpaPid(_) => {
                let pid = value
                    .parse::<u32>()
                    .map_err(|_| malformed(line_no, format!("invalid pid '{}'", value)))?;
                record.wpa_pid = Some(pid);
            }
            RecordKey::WpaConfig(_) => record.wpa_config = non_empty(value).map(PathBuf::from),
            RecordKey::InterfaceIp(_) => record.prior_ip = non_empty(value),
        }
    }

    Ok(record)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
