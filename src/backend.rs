//! Streaming backend selection and command-line templates.
//!
//! Three external encoders are supported, probed in this priority order:
//!
//! 1. GStreamer (`gst-launch-1.0`)
//! 2. VLC (`cvlc`, falling back to `vlc`)
//! 3. FFmpeg (`ffmpeg`)
//!
//! Each backend grabs the X11 screen, encodes H.264 and sends it as RTP to
//! the sink. Only the VLC template carries audio.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{DEFAULT_BITRATE, DEFAULT_FPS, DEFAULT_STREAM_PORT};
use crate::error::{StreamError, StreamErrorCode};

/// X11 display grabbed by the FFmpeg template.
const FFMPEG_DISPLAY: &str = ":0.0";

const MAX_HOSTNAME_LEN: usize = 253;

lazy_static! {
    static ref HOSTNAME: Regex =
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .unwrap();
}

/// Checks that `target` is an IP address or a plain DNS hostname.
///
/// The target is spliced into GStreamer pipeline descriptions and VLC
/// `--sout` chains, where characters like `!`, `{`, `}`, `,` or whitespace
/// would add elements of their own.
///
/// # Returns
/// - `Ok(())` for `192.168.49.10`, `fe80::1` or `tv.local`
/// - `Err(StreamError)` with [`StreamErrorCode::InvalidParams`] otherwise
pub fn validate_target(target: &str) -> Result<(), StreamError> {
    if target.trim().is_empty() {
        return Err(StreamError::new(
            StreamErrorCode::InvalidParams,
            "No target IP provided",
        ));
    }

    let valid = target.parse::<IpAddr>().is_ok()
        || (target.len() <= MAX_HOSTNAME_LEN && HOSTNAME.is_match(target));
    if !valid {
        return Err(StreamError::new(
            StreamErrorCode::InvalidParams,
            format!("Invalid target '{}': expected an IP address or hostname", target),
        ));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    GStreamer,
    Vlc,
    FFmpeg,
}

impl StreamBackend {
    /// All backends, highest priority first.
    pub const PRIORITY: [StreamBackend; 3] =
        [StreamBackend::GStreamer, StreamBackend::Vlc, StreamBackend::FFmpeg];

    /// Executables that provide this backend, preferred first.
    pub fn executables(self) -> &'static [&'static str] {
        match self {
            StreamBackend::GStreamer => &["gst-launch-1.0"],
            StreamBackend::Vlc => &["cvlc", "vlc"],
            StreamBackend::FFmpeg => &["ffmpeg"],
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            StreamBackend::GStreamer => "GStreamer",
            StreamBackend::Vlc => "VLC",
            StreamBackend::FFmpeg => "FFmpeg",
        }
    }
}

impl fmt::Display for StreamBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for StreamBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gstreamer" | "gst" => Ok(StreamBackend::GStreamer),
            "vlc" | "cvlc" => Ok(StreamBackend::Vlc),
            "ffmpeg" => Ok(StreamBackend::FFmpeg),
            other => Err(format!(
                "unknown backend '{}' (expected gstreamer, vlc or ffmpeg)",
                other
            )),
        }
    }
}

/// Parameters for one streaming invocation as given by the caller.
///
/// Zero for `port`, `fps` or `bitrate` selects the default; zero for
/// `width` or `height` lets the backend keep the captured resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    pub target: String,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Video bitrate in kbit/s.
    pub bitrate: u32,
    pub audio: bool,
}

impl StreamRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            port: 0,
            width: 0,
            height: 0,
            fps: 0,
            bitrate: 0,
            audio: true,
        }
    }

    /// Target and range checks applied before a user-supplied request is
    /// handed to the supervisor. Zero is always allowed since it means
    /// "default".
    pub fn validate_ranges(&self) -> Result<(), StreamError> {
        validate_target(&self.target)?;

        let checks: [(&str, u32, u32, u32); 4] = [
            ("width", self.width, 320, 3840),
            ("height", self.height, 240, 2160),
            ("fps", self.fps, 10, 60),
            ("bitrate", self.bitrate, 1000, 20000),
        ];

        for (name, value, min, max) in checks {
            if value != 0 && !(min..=max).contains(&value) {
                return Err(StreamError::new(
                    StreamErrorCode::InvalidParams,
                    format!("Invalid {}: {} (must be between {} and {})", name, value, min, max),
                ));
            }
        }

        if (self.width == 0) != (self.height == 0) {
            return Err(StreamError::new(
                StreamErrorCode::InvalidParams,
                "Width and height must be given together",
            ));
        }

        Ok(())
    }

    /// Applies the defaults for unset numeric fields.
    pub fn resolve(&self) -> ResolvedStream {
        ResolvedStream {
            target: self.target.clone(),
            port: if self.port == 0 { DEFAULT_STREAM_PORT } else { self.port },
            resolution: if self.width > 0 && self.height > 0 {
                Some((self.width, self.height))
            } else {
                None
            },
            fps: if self.fps == 0 { DEFAULT_FPS } else { self.fps },
            bitrate: if self.bitrate == 0 { DEFAULT_BITRATE } else { self.bitrate },
            audio: self.audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedStream {
    pub target: String,
    pub port: u16,
    /// `None` means auto.
    pub resolution: Option<(u32, u32)>,
    pub fps: u32,
    pub bitrate: u32,
    pub audio: bool,
}

impl ResolvedStream {
    pub fn resolution_label(&self) -> String {
        match self.resolution {
            Some((w, h)) => format!("{}x{}", w, h),
            None => "auto".to_string(),
        }
    }
}

/// Picks a backend and locates its executable.
#[derive(Debug, Clone, Default)]
pub struct BackendSelector {
    search_path: Option<OsString>,
}

impl BackendSelector {
    /// Selector that searches the process `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector that searches `path` (a `PATH`-style list) instead.
    pub fn with_search_path(path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(path.into()),
        }
    }

    pub fn search_path(&self) -> Option<&OsStr> {
        self.search_path.as_deref()
    }

    fn find(&self, executable: &str) -> Option<PathBuf> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        match &self.search_path {
            Some(path) => which::which_in(executable, Some(path), cwd).ok(),
            None => which::which(executable).ok(),
        }
    }

    /// First installed executable for `backend`, if any.
    pub fn locate(&self, backend: StreamBackend) -> Option<PathBuf> {
        backend.executables().iter().find_map(|exe| self.find(exe))
    }

    pub fn is_available(&self, backend: StreamBackend) -> bool {
        self.locate(backend).is_some()
    }

    /// A pinned backend is returned as-is. Otherwise the first installed one
    /// in priority order wins, and GStreamer is returned when none is
    /// installed so the failure shows up when the stream is spawned.
    pub fn select(&self, explicit: Option<StreamBackend>) -> StreamBackend {
        if let Some(backend) = explicit {
            return backend;
        }

        StreamBackend::PRIORITY
            .into_iter()
            .find(|b| self.is_available(*b))
            .unwrap_or(StreamBackend::GStreamer)
    }

    /// Program to execute for `backend`: the resolved path when installed,
    /// otherwise the preferred executable name.
    pub fn program(&self, backend: StreamBackend) -> PathBuf {
        self.locate(backend)
            .unwrap_or_else(|| PathBuf::from(backend.executables()[0]))
    }
}

/// Builds the argument vector (without the program) for `backend`.
pub fn build_args(backend: StreamBackend, program: &Path, stream: &ResolvedStream) -> Vec<String> {
    match backend {
        StreamBackend::GStreamer => gstreamer_args(stream),
        StreamBackend::Vlc => {
            let mut args = Vec::new();
            if program.file_name().is_some_and(|n| n == "vlc") {
                args.extend(["--intf".to_string(), "dummy".to_string()]);
            }
            args.extend(vlc_args(stream));
            args
        }
        StreamBackend::FFmpeg => ffmpeg_args(stream),
    }
}

fn gstreamer_args(s: &ResolvedStream) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "ximagesrc".into(),
        "!".into(),
        format!("video/x-raw,framerate={}/1", s.fps),
        "!".into(),
        "videoconvert".into(),
    ];

    if let Some((w, h)) = s.resolution {
        args.extend([
            "!".into(),
            "videoscale".into(),
            "!".into(),
            format!("video/x-raw,width={},height={}", w, h),
            "!".into(),
            "videoconvert".into(),
        ]);
    }

    args.extend([
        "!".into(),
        "x264enc".into(),
        "tune=zerolatency".into(),
        format!("bitrate={}", s.bitrate),
        "!".into(),
        "rtph264pay".into(),
        "!".into(),
        "udpsink".into(),
        format!("host={}", s.target),
        format!("port={}", s.port),
        "auto-multicast=true".into(),
    ]);

    args
}

fn vlc_args(s: &ResolvedStream) -> Vec<String> {
    let acodec = if s.audio { "mp3" } else { "none" };
    let transcode = match s.resolution {
        Some((w, h)) => format!(
            "vcodec=h264,vb={},width={},height={},fps={},acodec={}",
            s.bitrate, w, h, s.fps, acodec
        ),
        None => format!("vcodec=h264,vb={},fps={},acodec={}", s.bitrate, s.fps, acodec),
    };

    vec![
        "screen://".into(),
        format!(":screen-fps={}", s.fps),
        ":screen-caching=100".into(),
        "--sout".into(),
        format!(
            "#transcode{{{}}}:rtp{{dst={},port={},mux=ts}}",
            transcode, s.target, s.port
        ),
    ]
}

fn ffmpeg_args(s: &ResolvedStream) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-f".into(),
        "x11grab".into(),
        "-r".into(),
        s.fps.to_string(),
        "-i".into(),
        FFMPEG_DISPLAY.into(),
    ];

    if let Some((w, h)) = s.resolution {
        args.extend(["-vf".into(), format!("scale={}:{}", w, h)]);
    }

    args.extend([
        "-vcodec".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-b:v".into(),
        format!("{}k", s.bitrate),
        "-f".into(),
        "rtp".into(),
        format!("rtp://{}:{}", s.target, s.port),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn stream(resolution: Option<(u32, u32)>, audio: bool) -> ResolvedStream {
        ResolvedStream {
            target: "10.0.0.5".to_string(),
            port: 8554,
            resolution,
            fps: 30,
            bitrate: 8192,
            audio,
        }
    }

    fn fake_executable(dir: &Path, name: &str) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn request_defaults_fill_unset_fields() {
        let mut req = StreamRequest::new("10.0.0.5");
        req.width = 1280;
        let resolved = req.resolve();
        assert_eq!(resolved.port, DEFAULT_STREAM_PORT);
        assert_eq!(resolved.fps, DEFAULT_FPS);
        assert_eq!(resolved.bitrate, DEFAULT_BITRATE);
        // Height unset, so the backend picks the resolution.
        assert_eq!(resolved.resolution, None);
        assert_eq!(resolved.resolution_label(), "auto");
    }

    #[test]
    fn range_checks() {
        let mut req = StreamRequest::new("10.0.0.5");
        assert!(req.validate_ranges().is_ok());

        req.width = 1280;
        req.height = 720;
        req.fps = 30;
        req.bitrate = 8192;
        assert!(req.validate_ranges().is_ok());

        req.fps = 120;
        let err = req.validate_ranges().unwrap_err();
        assert_eq!(err.code, StreamErrorCode::InvalidParams);
        assert!(err.message.contains("fps"));

        req.fps = 30;
        req.height = 0;
        assert!(req.validate_ranges().is_err());
    }

    #[test]
    fn target_must_be_address_or_hostname() {
        for target in ["192.168.49.10", "fe80::1", "tv.local", "living-room-tv"] {
            assert!(validate_target(target).is_ok(), "{target}");
        }

        for target in [
            "",
            "10.0.0.5 ! filesink location=/root/.bashrc",
            "x,port=1}:file{dst=/etc/cron.d/x",
            "10.0.0.5\n",
            "-tv.local",
            "tv..local",
        ] {
            let err = validate_target(target).unwrap_err();
            assert_eq!(err.code, StreamErrorCode::InvalidParams, "{target:?}");
        }

        let req = StreamRequest::new("10.0.0.5 ! fakesink");
        assert_eq!(req.validate_ranges().unwrap_err().code, StreamErrorCode::InvalidParams);
    }

    #[test]
    fn gstreamer_template_with_and_without_scaling() {
        let scaled = gstreamer_args(&stream(Some((1280, 720)), true));
        assert!(scaled.contains(&"videoscale".to_string()));
        assert!(scaled.contains(&"video/x-raw,width=1280,height=720".to_string()));
        assert!(scaled.contains(&"host=10.0.0.5".to_string()));
        assert!(scaled.contains(&"port=8554".to_string()));
        assert!(scaled.contains(&"bitrate=8192".to_string()));

        let auto = gstreamer_args(&stream(None, true));
        assert!(!auto.contains(&"videoscale".to_string()));
        assert_eq!(auto[2], "video/x-raw,framerate=30/1");
        assert_eq!(auto.last().map(String::as_str), Some("auto-multicast=true"));
    }

    #[test]
    fn vlc_template_maps_audio_flag() {
        let with_audio = vlc_args(&stream(Some((1280, 720)), true));
        assert_eq!(
            with_audio[4],
            "#transcode{vcodec=h264,vb=8192,width=1280,height=720,fps=30,acodec=mp3}:rtp{dst=10.0.0.5,port=8554,mux=ts}"
        );

        let muted = vlc_args(&stream(None, false));
        assert_eq!(
            muted[4],
            "#transcode{vcodec=h264,vb=8192,fps=30,acodec=none}:rtp{dst=10.0.0.5,port=8554,mux=ts}"
        );
        assert_eq!(muted[1], ":screen-fps=30");
    }

    #[test]
    fn plain_vlc_gets_dummy_interface() {
        let args = build_args(StreamBackend::Vlc, Path::new("/usr/bin/vlc"), &stream(None, true));
        assert_eq!(&args[..3], ["--intf", "dummy", "screen://"]);

        let args = build_args(StreamBackend::Vlc, Path::new("/usr/bin/cvlc"), &stream(None, true));
        assert_eq!(args[0], "screen://");
    }

    #[test]
    fn ffmpeg_template() {
        let args = ffmpeg_args(&stream(Some((1920, 1080)), true));
        let joined = args.join(" ");
        assert!(joined.starts_with("-f x11grab -r 30 -i :0.0 -vf scale=1920:1080"));
        assert!(joined.ends_with("-b:v 8192k -f rtp rtp://10.0.0.5:8554"));

        let auto = ffmpeg_args(&stream(None, true));
        assert!(!auto.contains(&"-vf".to_string()));
    }

    #[test]
    fn pinned_backend_is_returned_unconditionally() {
        let empty = tempfile::tempdir().unwrap();
        let selector = BackendSelector::with_search_path(empty.path());
        assert_eq!(selector.select(Some(StreamBackend::FFmpeg)), StreamBackend::FFmpeg);
    }

    #[test]
    fn selection_follows_priority() {
        let dir = tempfile::tempdir().unwrap();
        fake_executable(dir.path(), "ffmpeg");
        let selector = BackendSelector::with_search_path(dir.path());
        assert_eq!(selector.select(None), StreamBackend::FFmpeg);

        fake_executable(dir.path(), "vlc");
        assert_eq!(selector.select(None), StreamBackend::Vlc);
        assert_eq!(selector.program(StreamBackend::Vlc), dir.path().join("vlc"));

        fake_executable(dir.path(), "gst-launch-1.0");
        assert_eq!(selector.select(None), StreamBackend::GStreamer);
    }

    #[test]
    fn nothing_installed_falls_back_to_gstreamer() {
        let empty = tempfile::tempdir().unwrap();
        let selector = BackendSelector::with_search_path(empty.path());
        assert_eq!(selector.select(None), StreamBackend::GStreamer);
        assert_eq!(
            selector.program(StreamBackend::GStreamer),
            PathBuf::from("gst-launch-1.0")
        );
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("GStreamer".parse::<StreamBackend>(), Ok(StreamBackend::GStreamer));
        assert_eq!("cvlc".parse::<StreamBackend>(), Ok(StreamBackend::Vlc));
        assert!("mplayer".parse::<StreamBackend>().is_err());
    }
}
