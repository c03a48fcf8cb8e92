//! Frame presentation loop
//!
//! Runs on the main thread. Each pass advances the playback clock, applies
//! the commands that arrived over the network, pops the frame due at the
//! current stream time and hands it to the renderer. The authority also
//! announces its clock to every subscriber from here.

mod session;

pub use session::run;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::assets::{
    AUDIO_SYNC_TOLERANCE, FALLBACK_FRAME_PERIOD, HEALTH_REPORT_INTERVAL, PRESENT_INTERVAL,
};
use crate::audio::AudioPlayer;
use crate::config::StereoMode;
use crate::decoder::Decoder;
use crate::net::multicast::{MulticastReceiver, MulticastSender};
use crate::net::{Authority, Command, NetEvent, PeerId, Subscriber};
use crate::pipeline::clock::{ClockTick, PlaybackClock, WallClock};
use crate::pipeline::frame_pool::FrameBuffer;
use crate::pipeline::health::PlaybackHealth;
use crate::pipeline::state::PlaybackState;
use crate::pipeline::types::Timestamp;
use crate::render::{Renderer, ViewState};
use crate::utils::sos::SignalOfStop;
use crate::utils::timefmt::describe_seek;

/// Which end of the sync protocol this player sits on
pub enum Link {
    Authority(Authority),
    Subscriber(Subscriber),
}

impl Link {
    fn try_next(&mut self) -> Option<NetEvent> {
        match self {
            Link::Authority(authority) => authority.try_next(),
            Link::Subscriber(subscriber) => subscriber.try_next(),
        }
    }

    fn authority(&self) -> Option<&Authority> {
        match self {
            Link::Authority(authority) => Some(authority),
            Link::Subscriber(_) => None,
        }
    }
}

/// Where presented rasters come from
pub enum FrameSource {
    /// Local decoding of the video file
    Decoded(Decoder),
    /// Rasters pushed by the authority over multicast
    Multicast {
        receiver: MulticastReceiver,
        frame: FrameBuffer,
    },
}

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub resync_threshold: Duration,
    pub sync_interval: Duration,
    pub stereo: StereoMode,
    /// Video path announced to subscribers
    pub video_path: String,
    /// Raster size announced to subscribers
    pub dimensions: Option<(u32, u32)>,
}

/// Outcome of one presentation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stream finished and looping is off
    Ended,
    /// The renderer's output was closed
    Closed,
}

pub struct Player {
    clock: PlaybackClock,
    state: PlaybackState,
    source: FrameSource,
    link: Link,
    renderer: Box<dyn Renderer>,
    view: ViewState,
    options: PlayerOptions,
    health: Arc<PlaybackHealth>,
    audio: Option<AudioPlayer>,
    multicast: Option<MulticastSender>,

    /// Raster on screen, handed back to the pool once replaced
    current: Option<FrameBuffer>,
    /// Stream time at which the raster on screen stops being current
    current_end: Timestamp,
    frame_period: Timestamp,
    /// Generation of the latest decoder seek; only its landing frame realigns
    seek_generation: u64,

    last_sync: Instant,
    last_report: Instant,
}

impl Player {
    pub fn new(
        source: FrameSource,
        link: Link,
        renderer: Box<dyn Renderer>,
        options: PlayerOptions,
        wall: Arc<dyn WallClock>,
        health: Arc<PlaybackHealth>,
    ) -> Self {
        let mut clock = PlaybackClock::new(wall, options.resync_threshold);
        let mut frame_period = Timestamp::from_duration(FALLBACK_FRAME_PERIOD);
        if let FrameSource::Decoded(decoder) = &source {
            let info = decoder.info();
            clock.set_duration(info.duration());
            if let Some(period) = info.frame_period() {
                frame_period = period;
            }
        }

        Self {
            clock,
            state: PlaybackState::Idle,
            source,
            link,
            renderer,
            view: ViewState::new(options.stereo),
            options,
            health,
            audio: None,
            multicast: None,
            current: None,
            current_end: Timestamp::ZERO,
            frame_period,
            seek_generation: 0,
            last_sync: Instant::now(),
            last_report: Instant::now(),
        }
    }

    /// Make the audio output the master clock.
    pub fn attach_audio(&mut self, output: AudioPlayer) {
        output.track().set_direction(self.view.yaw);
        self.clock.attach_audio(output.track().clone());
        self.audio = Some(output);
    }

    /// Push every presented raster to a multicast group.
    pub fn attach_multicast(&mut self, sender: MulticastSender) {
        self.multicast = Some(sender);
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Begin presenting, from `position` when joining a running cluster.
    pub fn start(&mut self, position: Option<Timestamp>) {
        match position {
            Some(position) => {
                self.transition(PlaybackState::Handshaking);
                self.seek(position, None);
            }
            None => self.clock.resync(Timestamp::ZERO),
        }
        self.transition(PlaybackState::Playing {
            started_at: Instant::now(),
        });
    }

    /// Present until the stream ends, the output closes or `stop` fires.
    pub fn run(&mut self, stop: &SignalOfStop) -> anyhow::Result<()> {
        loop {
            if stop.cancelled() {
                log::info!("Player: stop requested");
                self.transition(PlaybackState::Stopped);
                return Ok(());
            }

            match self.step()? {
                Flow::Continue => {
                    stop.wait_timeout(PRESENT_INTERVAL);
                }
                Flow::Ended => return Ok(()),
                Flow::Closed => {
                    log::info!("Player: output closed");
                    self.transition(PlaybackState::Stopped);
                    return Ok(());
                }
            }
        }
    }

    /// One presentation pass.
    pub fn step(&mut self) -> anyhow::Result<Flow> {
        if let ClockTick::Drifted { from, to } = self.clock.tick() {
            log::warn!(
                "Player: clock jumped back from {:.3}s to {:.3}s, resyncing",
                from.as_secs_f64(),
                to.as_secs_f64()
            );
            self.health.record_resync();
            self.seek(to, None);
        }

        while let Some(event) = self.link.try_next() {
            self.handle_event(event)?;
        }

        self.announce_time();

        let flow = if matches!(self.source, FrameSource::Decoded(_)) {
            self.present_decoded()?
        } else {
            self.present_multicast()?
        };

        self.report_health();

        if flow == Flow::Continue && self.renderer.should_close() {
            return Ok(Flow::Closed);
        }
        Ok(flow)
    }

    fn handle_event(&mut self, event: NetEvent) -> anyhow::Result<()> {
        match event {
            NetEvent::Connected { peer, addr } => {
                log::info!("Player: peer {} connected from {}", peer, addr);
            }
            NetEvent::Disconnected { peer } => match self.link {
                Link::Authority(_) => log::info!("Player: peer {} disconnected", peer),
                Link::Subscriber(_) => bail!("lost the connection to the authority"),
            },
            NetEvent::Command { peer, command } => self.apply(command, peer),
        }
        Ok(())
    }

    /// Apply a command received from `peer`.
    ///
    /// On the authority, shared-state changes are relayed to every other
    /// subscriber.
    pub fn apply(&mut self, command: Command, peer: PeerId) {
        log::trace!("Player: {} from peer {}", command.name(), peer);
        match command {
            Command::Greeting => self.greet(peer),
            Command::Path { path, .. } => {
                log::debug!("Player: ignoring path {} outside the handshake", path);
            }
            Command::Seek(target) => {
                self.seek(target, Some(peer));
            }
            Command::TimeSync(time) => self.time_sync(time),
            Command::Orientation { pitch, yaw } => self.set_orientation(pitch, yaw, Some(peer)),
            Command::PauseToggle => {
                self.toggle_pause(Some(peer));
            }
            Command::ShaderToggle => self.toggle_shader(Some(peer)),
        }
    }

    /// Jump to `target`, returning the clamped position.
    ///
    /// Frames keep flowing from the old position until the decoder delivers
    /// the first frame after the seek.
    pub fn seek(&mut self, target: Timestamp, origin: Option<PeerId>) -> Timestamp {
        let target = self.clock.seek(target);
        if let FrameSource::Decoded(decoder) = &self.source {
            self.seek_generation = decoder.seek_to(target);
        }
        if self.state == PlaybackState::Ended {
            self.transition(PlaybackState::Playing {
                started_at: Instant::now(),
            });
        }

        match self.link.authority() {
            Some(authority) => {
                log::info!(
                    "Player: seek to {}",
                    describe_seek(target, self.clock.duration())
                );
                authority.broadcast_except(&Command::Seek(target), origin);
            }
            None => log::debug!("Player: seek to {:.3}s", target.as_secs_f64()),
        }
        target
    }

    /// Flip pause, returning whether playback is now paused.
    pub fn toggle_pause(&mut self, origin: Option<PeerId>) -> bool {
        let paused = self.clock.toggle_pause();
        if paused {
            log::info!("Player: paused at {:.3}s", self.clock.now().as_secs_f64());
            if self.state.is_playing() || self.state == PlaybackState::Ended {
                self.transition(PlaybackState::Paused {
                    paused_at: Instant::now(),
                });
            }
        } else {
            log::info!("Player: resumed at {:.3}s", self.clock.now().as_secs_f64());
            if self.state.is_paused() {
                self.transition(PlaybackState::Playing {
                    started_at: Instant::now(),
                });
            }
        }

        if let Some(authority) = self.link.authority() {
            authority.broadcast_except(&Command::PauseToggle, origin);
        }
        paused
    }

    pub fn set_orientation(&mut self, pitch: f32, yaw: f32, origin: Option<PeerId>) {
        self.view.pitch = pitch;
        self.view.yaw = yaw;
        if let Some(audio) = &self.audio {
            audio.track().set_direction(yaw);
        }
        if let Some(authority) = self.link.authority() {
            authority.broadcast_except(&Command::Orientation { pitch, yaw }, origin);
        }
    }

    pub fn toggle_shader(&mut self, origin: Option<PeerId>) {
        self.view.alternate_shader = !self.view.alternate_shader;
        log::debug!("Player: alternate shader {}", self.view.alternate_shader);
        if let Some(authority) = self.link.authority() {
            authority.broadcast_except(&Command::ShaderToggle, origin);
        }
    }

    /// Bring a newly greeted subscriber up to the shared state.
    fn greet(&self, peer: PeerId) {
        let Some(authority) = self.link.authority() else {
            log::debug!("Player: ignoring greeting from peer {}", peer);
            return;
        };

        log::info!(
            "Player: peer {} joined ({} connected), sending {}",
            peer,
            authority.peer_count(),
            self.options.video_path
        );
        authority.send_to(
            peer,
            &Command::Path {
                path: self.options.video_path.clone(),
                dimensions: self.options.dimensions,
            },
        );
        authority.send_to(peer, &Command::TimeSync(self.clock.now()));

        if self.view.pitch != 0.0 || self.view.yaw != 0.0 {
            authority.send_to(
                peer,
                &Command::Orientation {
                    pitch: self.view.pitch,
                    yaw: self.view.yaw,
                },
            );
        }
        if self.clock.is_paused() {
            authority.send_to(peer, &Command::PauseToggle);
        }
        if self.view.alternate_shader {
            authority.send_to(peer, &Command::ShaderToggle);
        }
    }

    /// Follow the authority's clock without touching the decoder; the
    /// presentation loop skips frames to catch up.
    fn time_sync(&mut self, time: Timestamp) {
        if self.link.authority().is_some() {
            log::debug!("Player: ignoring time sync on the authority");
            return;
        }

        let offset = time.diff(self.clock.now());
        if offset > self.options.resync_threshold {
            log::info!(
                "Player: {:.3}s away from the authority, catching up",
                offset.as_secs_f64()
            );
            self.health.record_resync();
        }

        if !self.clock.follows_audio() {
            self.clock.resync(time);
        } else if offset > AUDIO_SYNC_TOLERANCE {
            self.clock.realign(time);
        }
    }

    fn announce_time(&mut self) {
        let Some(authority) = self.link.authority() else {
            return;
        };
        if self.last_sync.elapsed() >= self.options.sync_interval {
            authority.broadcast(&Command::TimeSync(self.clock.now()));
            self.last_sync = Instant::now();
        }
    }

    fn present_decoded(&mut self) -> anyhow::Result<Flow> {
        let FrameSource::Decoded(decoder) = &self.source else {
            return Ok(Flow::Continue);
        };
        let time_base = decoder.time_base();
        let frame_period = self.frame_period;

        let mut next: Option<FrameBuffer> = None;
        let mut ended = false;

        while self.clock.seek_pending() || self.clock.now() >= self.current_end {
            // read before popping: the decoder may finish in between
            let decoded_all = decoder.decoded_all();
            let Some(frame) = decoder.get_frame() else {
                if next.is_none() {
                    if decoded_all {
                        ended = true;
                    } else {
                        self.health.record_underrun();
                        log::debug!(
                            "Player: no frame ready at {:.3}s",
                            self.clock.now().as_secs_f64()
                        );
                    }
                }
                break;
            };

            // landing frames of superseded seeks are stale too
            let landed = frame.seek_result == Some(self.seek_generation);
            if self.clock.seek_pending() && !landed {
                decoder.return_frame(frame.buffer);
                self.health.record_discarded(1);
                continue;
            }

            let pts = time_base.ticks_to_timestamp(frame.buffer.pts);
            if landed {
                self.clock.take_seek_pending();
                self.clock.realign(pts);
            }

            let duration = if frame.buffer.duration > 0 {
                time_base.ticks_to_timestamp(frame.buffer.duration)
            } else {
                frame_period
            };
            self.current_end = Timestamp::from_micros(pts.micros + duration.micros);

            if let Some(skipped) = next.replace(frame.buffer) {
                decoder.return_frame(skipped);
                self.health.record_skipped();
            }
        }

        if ended && !self.clock.is_paused() && !self.state.is_stopped() {
            return Ok(self.finish());
        }

        match next {
            Some(buffer) => self.show(buffer)?,
            None => self.renderer.redraw(&self.view)?,
        }
        Ok(Flow::Continue)
    }

    fn present_multicast(&mut self) -> anyhow::Result<Flow> {
        let FrameSource::Multicast { receiver, frame } = &mut self.source else {
            return Ok(Flow::Continue);
        };
        // rasters arrive already positioned by the authority
        self.clock.take_seek_pending();

        match receiver.reassembler().take_latest(frame) {
            Some(tick) => {
                frame.pts = tick as i64;
                self.renderer.present(frame, self.clock.now(), &self.view)?;
                self.health.record_presented();
            }
            None => self.renderer.redraw(&self.view)?,
        }
        Ok(Flow::Continue)
    }

    fn show(&mut self, buffer: FrameBuffer) -> anyhow::Result<()> {
        if let Err(e) = self.renderer.present(&buffer, self.clock.now(), &self.view) {
            self.recycle(buffer);
            return Err(e);
        }
        self.health.record_presented();

        if let Some(sender) = &mut self.multicast
            && let Err(e) = sender.send_frame(buffer.data())
        {
            log::warn!("Player: multicast send failed: {}", e);
        }

        if let Some(previous) = self.current.replace(buffer) {
            self.recycle(previous);
        }
        Ok(())
    }

    fn recycle(&self, buffer: FrameBuffer) {
        if let FrameSource::Decoded(decoder) = &self.source {
            decoder.return_frame(buffer);
        }
    }

    fn finish(&mut self) -> Flow {
        log::info!(
            "Player: end of stream at {}",
            describe_seek(self.clock.now(), self.clock.duration())
        );
        self.transition(PlaybackState::Ended);
        Flow::Ended
    }

    fn report_health(&mut self) {
        if self.last_report.elapsed() < HEALTH_REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();

        log::info!("{}", self.health.summary());
        if let FrameSource::Decoded(decoder) = &self.source {
            let counts = decoder.pool().counts();
            log::debug!(
                "Player: pool {} fillable, {} showable, {} in flight",
                counts.fillable,
                counts.showable,
                counts.in_flight
            );
        }
    }

    fn transition(&mut self, next: PlaybackState) {
        if !self.state.can_transition_to(&next) {
            log::warn!("Player: ignoring transition {} -> {}", self.state, next);
            return;
        }
        if self.state.description() != next.description() {
            log::debug!("Player: {} -> {}", self.state, next);
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderOptions;
    use crate::decoder::synthetic::SyntheticSource;
    use crate::net::subscriber::AUTHORITY_PEER;
    use crate::pipeline::clock::{AudioSync, ManualClock};
    use std::sync::Mutex;
    use tokio::runtime::Runtime;

    /// Renderer recording the pts of every presented raster
    struct Recorder(Arc<Mutex<Vec<i64>>>);

    impl Renderer for Recorder {
        fn present(
            &mut self,
            frame: &FrameBuffer,
            _time: Timestamp,
            _view: &ViewState,
        ) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(frame.pts);
            Ok(())
        }
    }

    struct Harness {
        player: Player,
        wall: Arc<ManualClock>,
        presented: Arc<Mutex<Vec<i64>>>,
        health: Arc<PlaybackHealth>,
        /// Serves the subscriber harness
        _authority: Option<Authority>,
        runtime: Runtime,
    }

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn options() -> PlayerOptions {
        PlayerOptions {
            resync_threshold: Duration::from_secs(1),
            sync_interval: Duration::from_millis(10),
            stereo: StereoMode::Mono,
            video_path: "synthetic.mp4".into(),
            dimensions: Some((4, 2)),
        }
    }

    fn harness(source: SyntheticSource, subscriber: bool) -> Harness {
        harness_with(source, subscriber, false)
    }

    fn harness_with(source: SyntheticSource, subscriber: bool, looping: bool) -> Harness {
        let runtime = runtime();
        let health = Arc::new(PlaybackHealth::new());
        let decoder = Decoder::start(
            Box::new(source),
            DecoderOptions {
                pool_capacity: 8,
                looping,
                audio: None,
            },
            health.clone(),
        )
        .unwrap();

        let authority = runtime
            .block_on(Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone()))
            .unwrap();
        let (link, authority) = if subscriber {
            let addr = authority.local_addr();
            let subscriber = runtime
                .block_on(Subscriber::connect(addr, health.clone()))
                .unwrap();
            (Link::Subscriber(subscriber), Some(authority))
        } else {
            (Link::Authority(authority), None)
        };

        let wall = Arc::new(ManualClock::new(0));
        let presented = Arc::new(Mutex::new(Vec::new()));
        let player = Player::new(
            FrameSource::Decoded(decoder),
            link,
            Box::new(Recorder(presented.clone())),
            options(),
            wall.clone(),
            health.clone(),
        );

        Harness {
            player,
            wall,
            presented,
            health,
            _authority: authority,
            runtime,
        }
    }

    /// Step with `advance` of stream time per pass until `done` or a terminal flow.
    fn drive(h: &mut Harness, advance: Duration, done: impl Fn(&Harness) -> bool) -> Flow {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let flow = h.player.step().unwrap();
            if flow != Flow::Continue || done(h) {
                return flow;
            }
            h.wall.advance(advance);
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("player did not reach the expected state");
    }

    fn presented(h: &Harness) -> Vec<i64> {
        h.presented.lock().unwrap().clone()
    }

    #[test]
    fn test_plays_to_end_without_looping() {
        let mut h = harness(SyntheticSource::new(10, 5), false);
        h.player.start(None);

        let flow = drive(&mut h, Duration::from_millis(40), |_| false);
        assert_eq!(flow, Flow::Ended);
        assert_eq!(h.player.state(), PlaybackState::Ended);

        let pts = presented(&h);
        assert_eq!(pts.last(), Some(&360));
        assert!(pts.windows(2).all(|w| w[0] < w[1]), "{:?}", pts);
    }

    #[test]
    fn test_seek_realigns_to_keyframe() {
        let mut h = harness(SyntheticSource::new(100, 10), false);
        h.player.start(None);
        drive(&mut h, Duration::from_millis(40), |h| presented(h).len() >= 3);

        let before = presented(&h).len();
        let target = h.player.seek(Timestamp::from_micros(57 * 40_000 + 10_000), None);
        assert_eq!(target.micros, 2_290_000);

        drive(&mut h, Duration::ZERO, |h| !h.player.clock.seek_pending());
        let after = presented(&h)[before..].to_vec();
        assert_eq!(after.first(), Some(&2000));
        assert_eq!(h.player.now().micros, 2_000_000);
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let mut h = harness(SyntheticSource::new(10, 5), false);
        h.player.start(None);
        let target = h.player.seek(Timestamp::from_micros(60_000_000), None);
        assert_eq!(target.micros, 400_000);
    }

    #[test]
    fn test_pause_freezes_presentation() {
        let mut h = harness(SyntheticSource::new(100, 10), false);
        h.player.start(None);
        drive(&mut h, Duration::from_millis(40), |h| {
            presented(h).len() >= 2 && h.player.now() < h.player.current_end
        });

        assert!(h.player.toggle_pause(None));
        assert!(h.player.state().is_paused());
        let now = h.player.now();
        let shown = presented(&h).len();

        for _ in 0..10 {
            h.wall.advance(Duration::from_millis(100));
            h.player.step().unwrap();
        }
        assert_eq!(h.player.now(), now);
        assert_eq!(presented(&h).len(), shown);

        assert!(!h.player.toggle_pause(None));
        assert!(h.player.state().is_playing());
        h.wall.advance(Duration::from_millis(40));
        h.player.step().unwrap();
        assert_eq!(h.player.now().micros, now.micros + 40_000);
    }

    #[test]
    fn test_orientation_and_shader_update_view() {
        let mut h = harness(SyntheticSource::new(10, 5), false);
        h.player.start(None);

        h.player.apply(Command::Orientation { pitch: 0.5, yaw: -1.25 }, 3);
        h.player.apply(Command::ShaderToggle, 3);
        assert_eq!(h.player.view().pitch, 0.5);
        assert_eq!(h.player.view().yaw, -1.25);
        assert!(h.player.view().alternate_shader);
    }

    #[test]
    fn test_small_time_sync_moves_clock() {
        let mut h = harness(SyntheticSource::new(100, 10), true);
        h.player.start(Some(Timestamp::ZERO));

        h.player.apply(Command::TimeSync(Timestamp::from_micros(300_000)), 0);
        assert_eq!(h.player.now().micros, 300_000);
        assert_eq!(h.health.summary().resyncs, 0);
    }

    #[test]
    fn test_large_time_sync_never_seeks() {
        // keyframes every 2s, further apart than the resync threshold
        let mut h = harness(SyntheticSource::new(500, 50), true);
        h.player.start(Some(Timestamp::ZERO));
        drive(&mut h, Duration::ZERO, |h| !h.player.clock.seek_pending());

        for i in 0..12 {
            let time = Timestamp::from_micros(2_500_000 + i * 100_000);
            h.player.apply(Command::TimeSync(time), AUTHORITY_PEER);
            assert!(!h.player.clock.seek_pending());
            assert_eq!(h.player.now(), time);

            h.wall.advance(Duration::from_millis(100));
            h.player.step().unwrap();
        }
        assert_eq!(h.health.summary().resyncs, 1);

        // frame skipping catches up with the authority
        drive(&mut h, Duration::ZERO, |h| {
            presented(h).last().is_some_and(|&pts| pts >= 3_600)
        });
    }

    /// Audio master clock that jumps wherever it is moved
    #[derive(Default)]
    struct FollowingAudio {
        position: Mutex<Timestamp>,
        seeks: Mutex<Vec<Timestamp>>,
    }

    impl AudioSync for FollowingAudio {
        fn position(&self) -> Option<Timestamp> {
            Some(*self.position.lock().unwrap())
        }

        fn seek(&self, target: Timestamp) {
            *self.position.lock().unwrap() = target;
            self.seeks.lock().unwrap().push(target);
        }

        fn set_paused(&self, _paused: bool) {}
    }

    #[test]
    fn test_time_sync_with_audio_moves_audio_beyond_tolerance() {
        let mut h = harness(SyntheticSource::new(100, 10), true);
        h.player.start(None);
        let audio = Arc::new(FollowingAudio::default());
        h.player.clock.attach_audio(audio.clone());
        h.player.step().unwrap();

        h.player.apply(Command::TimeSync(Timestamp::from_micros(20_000)), AUTHORITY_PEER);
        assert!(audio.seeks.lock().unwrap().is_empty());

        h.player.apply(Command::TimeSync(Timestamp::from_micros(600_000)), AUTHORITY_PEER);
        assert_eq!(*audio.seeks.lock().unwrap(), vec![Timestamp::from_micros(600_000)]);
        assert_eq!(h.player.now().micros, 600_000);
        assert!(!h.player.clock.seek_pending());
        assert_eq!(h.health.summary().resyncs, 0);
    }

    #[test]
    fn test_back_to_back_seeks_realign_to_the_latest() {
        let mut h = harness(SyntheticSource::new(200, 10), false);
        h.player.start(None);
        drive(&mut h, Duration::from_millis(40), |h| presented(h).len() >= 2);
        let before = presented(&h).len();

        h.player.seek(Timestamp::from_micros(2_290_000), None);
        // let the first landing frame reach the showable queue
        std::thread::sleep(Duration::from_millis(50));
        h.player.seek(Timestamp::from_micros(5_700_000), None);

        drive(&mut h, Duration::ZERO, |h| !h.player.clock.seek_pending());
        assert_eq!(presented(&h)[before..].first(), Some(&5600));
        assert_eq!(h.player.now().micros, 5_600_000);
    }

    #[test]
    fn test_loop_wrap_realigns_without_drift() {
        let mut h = harness_with(SyntheticSource::new(10, 5), false, true);
        h.player.start(None);

        let flow = drive(&mut h, Duration::from_millis(40), |h| {
            presented(h).iter().filter(|&&pts| pts == 0).count() == 2
        });
        assert_eq!(flow, Flow::Continue);
        assert!(h.player.state().is_playing());

        let pts = presented(&h);
        let wrap = pts.iter().rposition(|&pts| pts == 0).unwrap();
        assert!(pts[wrap - 1] >= 320, "{:?}", pts);
        assert_eq!(h.player.now(), Timestamp::ZERO);

        for _ in 0..5 {
            h.wall.advance(Duration::from_millis(40));
            h.player.step().unwrap();
        }
        assert_eq!(h.player.now().micros, 200_000);
        assert_eq!(h.health.summary().resyncs, 0);
        assert!(!h.player.clock.seek_pending());
    }

    #[test]
    fn test_backward_clock_jump_triggers_one_corrective_seek() {
        let mut h = harness(SyntheticSource::new(200, 10), false);
        h.player.start(None);
        drive(&mut h, Duration::from_millis(40), |h| {
            h.player.now().micros >= 3_000_000
        });
        let before = presented(&h).len();

        h.wall.rewind(Duration::from_secs(2));
        h.player.step().unwrap();
        assert_eq!(h.health.summary().resyncs, 1);

        drive(&mut h, Duration::ZERO, |h| !h.player.clock.seek_pending());
        // 1.0s rounds down to the keyframe at 0.8s
        assert_eq!(presented(&h)[before..].first(), Some(&800));

        for _ in 0..10 {
            h.wall.advance(Duration::from_millis(40));
            h.player.step().unwrap();
        }
        assert_eq!(h.health.summary().resyncs, 1);
        assert!(!h.player.clock.seek_pending());
    }

    #[test]
    fn test_authority_loss_is_fatal_for_subscriber() {
        let mut h = harness(SyntheticSource::new(10, 5), true);
        h.player.start(Some(Timestamp::ZERO));
        let result = h.player.handle_event(NetEvent::Disconnected { peer: 0 });
        assert!(result.is_err());
    }

    #[test]
    fn test_greeting_gets_path_and_time() {
        let mut h = harness(SyntheticSource::new(100, 10), false);
        h.player.start(None);
        h.player.toggle_pause(None);

        let addr = h.player.link.authority().unwrap().local_addr();
        let mut subscriber = h
            .runtime
            .block_on(Subscriber::connect(addr, h.health.clone()))
            .unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && received.len() < 3 {
            h.player.step().unwrap();
            while let Some(NetEvent::Command { command, .. }) = subscriber.try_next() {
                if !matches!(command, Command::TimeSync(_)) || received.len() == 1 {
                    received.push(command);
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            received[0],
            Command::Path {
                path: "synthetic.mp4".into(),
                dimensions: Some((4, 2)),
            }
        );
        assert!(matches!(received[1], Command::TimeSync(_)));
        assert_eq!(received[2], Command::PauseToggle);
    }

    #[test]
    fn test_authority_relays_to_other_subscribers() {
        let mut h = harness(SyntheticSource::new(100, 10), false);
        h.player.start(None);

        let addr = h.player.link.authority().unwrap().local_addr();
        let mut origin = h
            .runtime
            .block_on(Subscriber::connect(addr, h.health.clone()))
            .unwrap();
        let mut other = h
            .runtime
            .block_on(Subscriber::connect(addr, h.health.clone()))
            .unwrap();

        origin.send(&Command::PauseToggle);

        let mut origin_got = Vec::new();
        let mut other_got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !other_got.contains(&Command::PauseToggle) {
            h.player.step().unwrap();
            while let Some(NetEvent::Command { command, .. }) = origin.try_next() {
                origin_got.push(command);
            }
            while let Some(NetEvent::Command { command, .. }) = other.try_next() {
                other_got.push(command);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(h.player.state().is_paused());
        assert!(other_got.contains(&Command::PauseToggle));
        assert!(!origin_got.contains(&Command::PauseToggle));
    }
}
