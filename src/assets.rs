use std::time::Duration;

// decoding
/// Rasters in the frame pool: five seconds at 24 fps
pub const FRAME_POOL_CAPACITY: usize = 24 * 5;
/// Longest the decode thread blocks before re-checking its exit flag
pub const DECODER_WAIT: Duration = Duration::from_millis(10);
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 10;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// Display time of a frame whose duration the container does not state
pub const FALLBACK_FRAME_PERIOD: Duration = Duration::from_micros(1_000_000 / 24);

// synchronization
pub const RESYNC_THRESHOLD: Duration = Duration::from_secs(1);
pub const TIME_SYNC_INTERVAL: Duration = Duration::from_millis(100);
/// Time-sync offsets below this are left to the audio master clock
pub const AUDIO_SYNC_TOLERANCE: Duration = Duration::from_millis(50);
pub const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a subscriber waits for the authority's path and time
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Presentation loop period when the renderer does not pace it
pub const PRESENT_INTERVAL: Duration = Duration::from_millis(5);

// connections
pub const SYNC_SERVICE_PORT: u16 = 2345;
/// Receive timeout of blocking sockets, so quit flags are observed
pub const SOCKET_POLL: Duration = Duration::from_millis(500);
/// Largest accepted control message
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

// multicast
pub const MULTICAST_PORT: u16 = 2346;
pub const MULTICAST_TTL: u32 = 1;
pub const MULTICAST_HEADER_LEN: usize = 8 + 8 + 2;
/// Payload bytes per datagram, leaving room for IP/UDP headers
pub const MULTICAST_CHUNK_LEN: usize = 0xFFFF - MULTICAST_HEADER_LEN - 256;

// screens
pub const DEFAULT_PIXEL_WIDTH: u32 = 640;
pub const DEFAULT_PIXEL_HEIGHT: u32 = 320;

pub const GREETING: &[u8] = b"HELLO";
