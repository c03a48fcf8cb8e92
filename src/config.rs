use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde::Deserialize;

use crate::assets::{
    DEFAULT_PIXEL_HEIGHT, DEFAULT_PIXEL_WIDTH, MULTICAST_PORT, MULTICAST_TTL, RESYNC_THRESHOLD,
    SYNC_SERVICE_PORT, TIME_SYNC_INTERVAL,
};
use crate::audio::AudioLayout;
use crate::net::multicast::MulticastGroup;

/// What this process does in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Authority that also renders
    Server,
    /// Authority without displays
    Headless,
    /// Subscriber following the authority at `server`
    Client { server: String },
}

impl Role {
    pub fn is_authority(&self) -> bool {
        matches!(self, Role::Server | Role::Headless)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StereoMode {
    #[default]
    Mono,
    SideBySide,
    Interleaved,
}

impl FromStr for StereoMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mono" => Ok(StereoMode::Mono),
            "side-by-side" | "sbs" => Ok(StereoMode::SideBySide),
            "interleaved" => Ok(StereoMode::Interleaved),
            other => Err(anyhow!("unknown stereo mode '{}'", other)),
        }
    }
}

/// Windowing system a screen is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowBackend {
    #[default]
    Glfw,
    X11,
}

/// One physical display of a host
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScreenConfig {
    #[serde(default)]
    pub index: u32,
    /// Physical size, in the same unit as `origin`
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
    /// Orientation in degrees
    #[serde(default)]
    pub heading: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default)]
    pub roll: f32,
    #[serde(default)]
    pub origin: [f32; 3],
    #[serde(default = "default_pixel_width")]
    pub pixel_width: u32,
    #[serde(default = "default_pixel_height")]
    pub pixel_height: u32,
    #[serde(default)]
    pub fullscreen: bool,
    #[serde(default)]
    pub backend: WindowBackend,
    /// X display name, for the X11 backend
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub override_redirect: bool,
}

fn default_pixel_width() -> u32 {
    DEFAULT_PIXEL_WIDTH
}

fn default_pixel_height() -> u32 {
    DEFAULT_PIXEL_HEIGHT
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 0.0,
            height: 0.0,
            heading: 0.0,
            pitch: 0.0,
            roll: 0.0,
            origin: [0.0; 3],
            pixel_width: DEFAULT_PIXEL_WIDTH,
            pixel_height: DEFAULT_PIXEL_HEIGHT,
            fullscreen: false,
            backend: WindowBackend::Glfw,
            display: None,
            x: 0,
            y: 0,
            override_redirect: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HostScreens {
    host: String,
    screens: Vec<ScreenConfig>,
}

/// Pick `host`'s screens from a screen config file.
///
/// With `monitor`, only the screen at that position in the host's list is
/// kept, re-indexed to 0.
pub fn load_screens(path: &Path, host: &str, monitor: Option<u32>) -> anyhow::Result<Vec<ScreenConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read screen config {}", path.display()))?;
    parse_screens(&text, host, monitor)
        .with_context(|| format!("invalid screen config {}", path.display()))
}

fn parse_screens(text: &str, host: &str, monitor: Option<u32>) -> anyhow::Result<Vec<ScreenConfig>> {
    let hosts: Vec<HostScreens> = serde_json::from_str(text)?;
    let mut screens = hosts
        .into_iter()
        .find(|entry| entry.host == host)
        .map(|entry| entry.screens)
        .ok_or_else(|| anyhow!("no screens configured for host '{}'", host))?;

    if screens.is_empty() {
        bail!("host '{}' has no screens", host);
    }

    if let Some(monitor) = monitor {
        let count = screens.len();
        let mut screen = screens
            .into_iter()
            .nth(monitor as usize)
            .ok_or_else(|| anyhow!("host '{}' has {} screens, no monitor {}", host, count, monitor))?;
        screen.index = 0;
        screens = vec![screen];
    }

    Ok(screens)
}

/// Everything the player needs to know, validated
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub video: Option<PathBuf>,
    pub screens: Vec<ScreenConfig>,
    pub host: String,
    pub port: u16,
    pub looping: bool,
    pub audio: Option<AudioLayout>,
    pub stereo: StereoMode,
    pub multicast: Option<MulticastGroup>,
    pub dump_frames: Option<PathBuf>,
    pub resync_threshold: Duration,
    pub sync_interval: Duration,
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let server = matches.get_flag("server");
        let headless = matches.get_flag("headless");
        let client = matches.get_one::<String>("client").cloned();

        let role = match (server, headless, client) {
            (true, false, None) => Role::Server,
            (false, true, None) => Role::Headless,
            (false, false, Some(server)) => Role::Client { server },
            (false, false, None) => bail!("one of --server, --headless or --client is required"),
            _ => bail!("--server, --headless and --client are mutually exclusive"),
        };

        let video = matches.get_one::<PathBuf>("video").cloned();
        if role.is_authority() && video.is_none() {
            bail!("--video is required for --server and --headless");
        }

        let host = match matches.get_one::<String>("host") {
            Some(host) => host.clone(),
            None => crate::utils::hostname().unwrap_or_else(|| "localhost".into()),
        };
        let monitor = matches.get_one::<u32>("monitor").copied();

        let screens = match (matches.get_one::<PathBuf>("config"), &role) {
            (Some(path), Role::Headless) => {
                log::warn!("Config: headless peers ignore the screen config {}", path.display());
                Vec::new()
            }
            (Some(path), _) => load_screens(path, &host, monitor)?,
            (None, Role::Client { .. }) => bail!("--config is required for --client"),
            (None, Role::Server) => vec![ScreenConfig::default()],
            (None, Role::Headless) => Vec::new(),
        };

        let audio = match (matches.get_flag("audio"), matches.get_flag("quad-binaural")) {
            (_, true) => Some(AudioLayout::QuadBinaural),
            (true, false) => Some(AudioLayout::Stereo),
            (false, false) => None,
        };

        let stereo = match matches.get_one::<String>("stereo") {
            Some(mode) => mode.parse()?,
            None => StereoMode::default(),
        };

        let multicast = match matches.get_one::<Ipv4Addr>("mcgroup") {
            Some(group) => {
                if !group.is_multicast() {
                    bail!("{} is not a multicast address", group);
                }
                Some(MulticastGroup {
                    group: *group,
                    interface: matches
                        .get_one::<Ipv4Addr>("mciface")
                        .copied()
                        .unwrap_or(Ipv4Addr::UNSPECIFIED),
                    port: matches
                        .get_one::<u16>("mcport")
                        .copied()
                        .unwrap_or(MULTICAST_PORT),
                    ttl: matches
                        .get_one::<u32>("mcttl")
                        .copied()
                        .unwrap_or(MULTICAST_TTL),
                })
            }
            None => None,
        };

        let millis = |name: &str, default: Duration| {
            matches
                .get_one::<u64>(name)
                .map(|ms| Duration::from_millis(*ms))
                .unwrap_or(default)
        };

        Ok(Self {
            role,
            video,
            screens,
            host,
            port: matches
                .get_one::<u16>("port")
                .copied()
                .unwrap_or(SYNC_SERVICE_PORT),
            looping: matches.get_flag("loop"),
            audio,
            stereo,
            multicast,
            dump_frames: matches.get_one::<PathBuf>("dump-frames").cloned(),
            resync_threshold: millis("resync-threshold-ms", RESYNC_THRESHOLD),
            sync_interval: millis("sync-interval-ms", TIME_SYNC_INTERVAL),
        })
    }
}

/// Command line definition
pub fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("server")
                .long("server")
                .help("Act as the authority and render locally.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("headless")
                .long("headless")
                .help("Act as the authority without opening any screen.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("client")
                .long("client")
                .value_name("HOST")
                .help("Follow the authority running on HOST."),
        )
        .arg(
            Arg::new("video")
                .long("video")
                .value_name("PATH")
                .help("Video to play. On a client, overrides the path sent by the authority.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("SCREENS")
                .help("JSON screen configuration.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("NAME")
                .help("Host name to look up in the screen configuration."),
        )
        .arg(
            Arg::new("monitor")
                .long("monitor")
                .value_name("INDEX")
                .help("Only drive this screen of the host.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Sync protocol TCP port.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("loop")
                .long("loop")
                .help("Restart from the beginning at the end of the video.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("audio")
                .long("audio")
                .help("Play the video's audio track.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quad-binaural")
                .long("quad-binaural")
                .help("Treat the audio track as four stereo recordings mixed by view direction.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stereo")
                .long("stereo")
                .value_name("MODE")
                .help("Stereo layout of the video: mono, side-by-side or interleaved."),
        )
        .arg(
            Arg::new("mcgroup")
                .long("mcgroup")
                .value_name("ADDR")
                .help("Distribute decoded frames over this multicast group.")
                .value_parser(value_parser!(Ipv4Addr)),
        )
        .arg(
            Arg::new("mciface")
                .long("mciface")
                .value_name("ADDR")
                .help("Local interface address for multicast.")
                .value_parser(value_parser!(Ipv4Addr)),
        )
        .arg(
            Arg::new("mcport")
                .long("mcport")
                .value_name("PORT")
                .help("Multicast UDP port.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("mcttl")
                .long("mcttl")
                .value_name("TTL")
                .help("Multicast time to live.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("dump-frames")
                .long("dump-frames")
                .value_name("DIR")
                .help("Write every presented frame to DIR as a PPM image.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("resync-threshold-ms")
                .long("resync-threshold-ms")
                .value_name("MS")
                .help("Clock jump that triggers a corrective seek.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("sync-interval-ms")
                .long("sync-interval-ms")
                .value_name("MS")
                .help("Interval between time broadcasts from the authority.")
                .value_parser(value_parser!(u64)),
        )
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
