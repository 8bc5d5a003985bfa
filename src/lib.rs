//! WiFi Display session control.
//!
//! This library takes over a wireless interface for a peer-to-peer
//! (WiFi Direct) screen-casting session and puts the previous network setup
//! back afterwards. It also supervises the external encoder that streams the
//! screen to the sink.
//!
//! # Modules
//!
//! - [`backend`] - Streaming backend selection and command-line templates
//! - [`config`] - Settings file with session and stream defaults
//! - [`error`] - Error types for the library
//! - [`interface`] - Interface name validation, discovery and P2P probing
//! - [`interrupt`] - Termination signal handling while a session is prepared
//! - [`ops`] - External tools (`nmcli`, `ip`, `iw`, `wpa_supplicant`)
//! - [`prepare`] - Capture current state and take the interface over
//! - [`report`] - Structured outcomes of prepare and restore
//! - [`restore`] - Undo a prepared session from its record
//! - [`session`] - Scope guard tying prepare and restore together
//! - [`store`] - The on-disk undo record
//! - [`stream`] - Streaming child process supervision
//!
//! # Example Usage
//!
//! ```no_run
//! use wfd_session::{prepare, restore, Interrupt, SessionOptions, SystemNetOps};
//! use wfd_session::config::Config;
//!
//! let cfg = Config::load().expect("config");
//! let options = SessionOptions::from_config(&cfg.session);
//!
//! let report = prepare(&SystemNetOps, &options, "wlan0", &Interrupt::new())
//!     .expect("prepare failed");
//! println!("Session record: {}", report.record_path.display());
//!
//! // ... run the P2P session ...
//!
//! let restored = restore(&SystemNetOps, &options).expect("restore failed");
//! assert!(restored.is_clean());
//! ```

/// Streaming backend module: priority list, executable lookup and the
/// GStreamer, VLC and FFmpeg command-line templates.
pub mod backend;

/// Configuration module for session and stream defaults.
/// Reads the optional TOML file under the user's config directory.
pub mod config;

/// Error types for the library, built with `thiserror`.
pub mod error;

/// Interface module: name validation, wireless interface discovery and
/// the P2P capability check.
pub mod interface;

/// Termination signal flag and its tokio listener.
pub mod interrupt;

/// Trait over the host's network tools plus the real implementation.
pub mod ops;

/// Captures the interface's network state and takes it over for P2P.
pub mod prepare;

/// Serializable outcomes of prepare and restore.
pub mod report;

/// Undoes a prepared session from its record, step by step.
pub mod restore;

/// Session options and the restore-once scope guard.
pub mod session;

/// Persisted `KEY=VALUE` undo record with strict parsing.
pub mod store;

/// Supervision of the single screen-streaming child process.
pub mod stream;

pub use backend::{BackendSelector, StreamBackend, StreamRequest};

pub use error::{SessionError, StreamError, StreamErrorCode};

pub use interrupt::Interrupt;

pub use ops::{NetOps, SystemNetOps};

pub use prepare::prepare;

pub use report::{PrepareReport, RestoreReport, Step};

pub use restore::{restore, restore_from};

pub use session::{PreparedSession, SessionOptions};

pub use store::{SessionRecord, SessionStore};

pub use stream::StreamSupervisor;
