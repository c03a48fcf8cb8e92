//! Role setup: open the video, join or host the sync protocol, then hand
//! over to the presentation loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use tokio::runtime::Runtime;

use super::{FrameSource, Link, Player, PlayerOptions};
use crate::assets::{FRAME_POOL_CAPACITY, HANDSHAKE_TIMEOUT, SOCKET_POLL};
use crate::audio::{AudioPlayer, AudioTrack};
use crate::config::{Config, Role};
use crate::decoder::{Decoder, DecoderOptions};
use crate::net::multicast::{MulticastReceiver, MulticastSender};
use crate::net::subscriber::AUTHORITY_PEER;
use crate::net::{Authority, Command, NetEvent, Subscriber};
use crate::pipeline::clock::MonotonicClock;
use crate::pipeline::frame_pool::FrameBuffer;
use crate::pipeline::health::PlaybackHealth;
use crate::pipeline::types::Timestamp;
use crate::render::{HeadlessRenderer, Renderer, SnapshotRenderer};
use crate::utils::sos::SignalOfStop;

/// Play according to `config` until the stream ends or `stop` fires.
pub fn run(config: &Config, stop: &SignalOfStop) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("network")
        .enable_all()
        .build()
        .context("unable to start the network runtime")?;
    let health = Arc::new(PlaybackHealth::new());

    let mut player = match &config.role {
        Role::Server | Role::Headless => start_authority(config, &runtime, health.clone())?,
        Role::Client { server } => start_subscriber(config, server, &runtime, health.clone())?,
    };

    let result = player.run(stop);
    log::info!("{}", health.summary());

    drop(player);
    runtime.shutdown_timeout(SOCKET_POLL);
    result
}

fn decoder_options(config: &Config) -> DecoderOptions {
    DecoderOptions {
        pool_capacity: FRAME_POOL_CAPACITY,
        looping: config.looping,
        audio: config.audio,
    }
}

fn player_options(
    config: &Config,
    video_path: String,
    dimensions: Option<(u32, u32)>,
) -> PlayerOptions {
    PlayerOptions {
        resync_threshold: config.resync_threshold,
        sync_interval: config.sync_interval,
        stereo: config.stereo,
        video_path,
        dimensions,
    }
}

fn renderer(config: &Config) -> anyhow::Result<Box<dyn Renderer>> {
    Ok(match &config.dump_frames {
        Some(dir) => Box::new(SnapshotRenderer::new(dir, &config.screens)?),
        None => Box::new(HeadlessRenderer::new(&config.screens)),
    })
}

fn start_audio(player: &mut Player, track: Arc<AudioTrack>) {
    match AudioPlayer::start(track) {
        Ok(output) => player.attach_audio(output),
        Err(e) => log::warn!("Player: audio output unavailable: {:#}", e),
    }
}

fn start_authority(
    config: &Config,
    runtime: &Runtime,
    health: Arc<PlaybackHealth>,
) -> anyhow::Result<Player> {
    let path = config.video.as_deref().context("no video to play")?;
    let decoder = Decoder::open(path, decoder_options(config), health.clone())?;
    let info = decoder.info();
    let audio = decoder.audio();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let authority = runtime.block_on(Authority::bind(addr, health.clone()))?;

    let mut player = Player::new(
        FrameSource::Decoded(decoder),
        Link::Authority(authority),
        renderer(config)?,
        player_options(
            config,
            path.display().to_string(),
            Some((info.width, info.height)),
        ),
        Arc::new(MonotonicClock::new()),
        health,
    );

    if let Some(track) = audio {
        start_audio(&mut player, track);
    }
    if let Some(group) = config.multicast {
        player.attach_multicast(MulticastSender::new(group)?);
    }

    player.start(None);
    Ok(player)
}

fn start_subscriber(
    config: &Config,
    server: &str,
    runtime: &Runtime,
    health: Arc<PlaybackHealth>,
) -> anyhow::Result<Player> {
    let (mut subscriber, mut handshake) = runtime.block_on(async {
        let addr = resolve(server, config.port).await?;
        let mut subscriber = Subscriber::connect(addr, health.clone()).await?;
        let handshake = handshake(&mut subscriber).await?;
        anyhow::Ok((subscriber, handshake))
    })?;

    let path = match &config.video {
        Some(path) => {
            log::info!(
                "Player: playing {} instead of {}",
                path.display(),
                handshake.path
            );
            path.display().to_string()
        }
        None => handshake.path,
    };

    let (source, audio) = match config.multicast {
        Some(group) => {
            let (width, height) = handshake
                .dimensions
                .context("the authority did not announce the frame size needed for multicast")?;
            let frame = FrameBuffer::new(width, height);
            let receiver = MulticastReceiver::start(group, frame.len())?;
            (FrameSource::Multicast { receiver, frame }, None)
        }
        None => {
            let decoder = Decoder::open(Path::new(&path), decoder_options(config), health.clone())?;
            let audio = decoder.audio();
            (FrameSource::Decoded(decoder), audio)
        }
    };

    // opening took a while; start from where the authority is now
    handshake.catch_up(&mut subscriber)?;

    let mut player = Player::new(
        source,
        Link::Subscriber(subscriber),
        renderer(config)?,
        player_options(config, path, handshake.dimensions),
        Arc::new(MonotonicClock::new()),
        health,
    );
    if let Some(track) = audio {
        start_audio(&mut player, track);
    }

    player.start(Some(handshake.time));
    for command in handshake.pending {
        player.apply(command, AUTHORITY_PEER);
    }
    Ok(player)
}

/// `host:port`, or a bare host name joined with `port`.
async fn resolve(server: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((server, port))
        .await
        .with_context(|| format!("unable to resolve {}", server))?
        .next()
        .ok_or_else(|| anyhow!("no address found for {}", server))
}

/// What a subscriber learns from the authority before it can play
#[derive(Debug, Clone, PartialEq)]
struct Handshake {
    path: String,
    dimensions: Option<(u32, u32)>,
    time: Timestamp,
    /// Shared-state commands received meanwhile, in order
    pending: Vec<Command>,
}

impl Handshake {
    /// Fold in a command received after the handshake completed.
    fn absorb(&mut self, command: Command) {
        match command {
            Command::TimeSync(at) | Command::Seek(at) => self.time = at,
            Command::Path { path, .. } => {
                log::debug!("Player: ignoring path {} announced twice", path);
            }
            Command::Greeting => {}
            other => self.pending.push(other),
        }
    }

    /// Absorb whatever the authority sent while the video was being opened.
    fn catch_up(&mut self, subscriber: &mut Subscriber) -> anyhow::Result<()> {
        while let Some(event) = subscriber.try_next() {
            match event {
                NetEvent::Command { command, .. } => self.absorb(command),
                NetEvent::Connected { .. } => {}
                NetEvent::Disconnected { .. } => {
                    bail!("the authority closed the connection while the video was opening")
                }
            }
        }
        Ok(())
    }
}

/// Wait for the video path and the authority's clock.
async fn handshake(subscriber: &mut Subscriber) -> anyhow::Result<Handshake> {
    let exchange = async {
        let mut announced: Option<(String, Option<(u32, u32)>)> = None;
        let mut time: Option<Timestamp> = None;
        let mut pending = Vec::new();

        loop {
            if let (Some((path, dimensions)), Some(time)) = (&announced, time) {
                return Ok(Handshake {
                    path: path.clone(),
                    dimensions: *dimensions,
                    time,
                    pending,
                });
            }

            match subscriber.next().await {
                Some(NetEvent::Command { command, .. }) => match command {
                    Command::Path { path, dimensions } => {
                        log::info!("Player: authority plays {}", path);
                        announced = Some((path, dimensions));
                    }
                    // only the latest position matters
                    Command::TimeSync(at) | Command::Seek(at) => time = Some(at),
                    Command::Greeting => {}
                    other => pending.push(other),
                },
                Some(NetEvent::Connected { .. }) => {}
                Some(NetEvent::Disconnected { .. }) | None => {
                    bail!("the authority closed the connection during the handshake")
                }
            }
        }
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| {
            anyhow!(
                "no path and time from the authority within {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            )
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handshake_collects_path_time_and_pending() {
        let health = Arc::new(PlaybackHealth::new());
        let mut authority = Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone())
            .await
            .unwrap();
        let mut subscriber = Subscriber::connect(authority.local_addr(), health)
            .await
            .unwrap();

        let peer = loop {
            if let Some(NetEvent::Command {
                peer,
                command: Command::Greeting,
            }) = authority.next().await
            {
                break peer;
            }
        };

        authority.send_to(peer, &Command::ShaderToggle);
        authority.send_to(peer, &Command::TimeSync(Timestamp::from_micros(1_000)));
        authority.send_to(peer, &Command::TimeSync(Timestamp::from_micros(2_000)));
        authority.send_to(
            peer,
            &Command::Path {
                path: "/media/dome.mp4".into(),
                dimensions: Some((3840, 1920)),
            },
        );

        let handshake = handshake(&mut subscriber).await.unwrap();
        assert_eq!(
            handshake,
            Handshake {
                path: "/media/dome.mp4".into(),
                dimensions: Some((3840, 1920)),
                time: Timestamp::from_micros(2_000),
                pending: vec![Command::ShaderToggle],
            }
        );
    }

    #[tokio::test]
    async fn test_catch_up_takes_latest_time() {
        let health = Arc::new(PlaybackHealth::new());
        let mut authority = Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone())
            .await
            .unwrap();
        let mut subscriber = Subscriber::connect(authority.local_addr(), health)
            .await
            .unwrap();

        let peer = loop {
            if let Some(NetEvent::Command {
                peer,
                command: Command::Greeting,
            }) = authority.next().await
            {
                break peer;
            }
        };
        authority.send_to(
            peer,
            &Command::Path {
                path: "/media/dome.mp4".into(),
                dimensions: None,
            },
        );
        authority.send_to(peer, &Command::TimeSync(Timestamp::from_micros(1_000)));
        let mut handshake = handshake(&mut subscriber).await.unwrap();

        // sent while the subscriber is busy opening the video
        authority.send_to(peer, &Command::TimeSync(Timestamp::from_micros(900_000)));
        authority.send_to(peer, &Command::PauseToggle);
        authority.send_to(peer, &Command::TimeSync(Timestamp::from_micros(950_000)));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handshake.time != Timestamp::from_micros(950_000) {
            assert!(tokio::time::Instant::now() < deadline, "{:?}", handshake);
            tokio::time::sleep(Duration::from_millis(5)).await;
            handshake.catch_up(&mut subscriber).unwrap();
        }
        assert_eq!(handshake.pending, vec![Command::PauseToggle]);
    }

    #[tokio::test]
    async fn test_catch_up_reports_lost_authority() {
        let health = Arc::new(PlaybackHealth::new());
        let authority = Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone())
            .await
            .unwrap();
        let mut subscriber = Subscriber::connect(authority.local_addr(), health)
            .await
            .unwrap();
        let mut handshake = Handshake {
            path: "/media/dome.mp4".into(),
            dimensions: None,
            time: Timestamp::ZERO,
            pending: Vec::new(),
        };

        drop(authority);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handshake.catch_up(&mut subscriber).is_err() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_handshake_fails_when_authority_leaves() {
        let health = Arc::new(PlaybackHealth::new());
        let authority = Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone())
            .await
            .unwrap();
        let mut subscriber = Subscriber::connect(authority.local_addr(), health)
            .await
            .unwrap();

        drop(authority);
        assert!(handshake(&mut subscriber).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_accepts_address_or_host() {
        let addr = resolve("127.0.0.1:4000", 2345).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());

        let addr = resolve("localhost", 2345).await.unwrap();
        assert_eq!(addr.port(), 2345);
    }
}
