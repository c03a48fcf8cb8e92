//! Renderer seam of the presentation loop
//!
//! GPU drawing lives outside this crate; the loop only hands rasters and
//! the shared view state to a [`Renderer`]. Two renderers ship here: one
//! that just tracks what would be on screen, and one that dumps every
//! presented raster as a binary PPM image.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{ScreenConfig, StereoMode, WindowBackend};
use crate::pipeline::frame_pool::FrameBuffer;
use crate::pipeline::types::Timestamp;

/// View parameters shared across the cluster
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    /// Radians
    pub pitch: f32,
    /// Radians, counter-clockwise from the front
    pub yaw: f32,
    /// Alternate shading mode toggled by the authority
    pub alternate_shader: bool,
    pub stereo: StereoMode,
}

impl ViewState {
    pub fn new(stereo: StereoMode) -> Self {
        Self {
            pitch: 0.0,
            yaw: 0.0,
            alternate_shader: false,
            stereo,
        }
    }
}

pub trait Renderer {
    /// Show a new raster. The buffer stays untouched until the next
    /// `present` returns.
    fn present(&mut self, frame: &FrameBuffer, time: Timestamp, view: &ViewState)
    -> anyhow::Result<()>;

    /// Draw again without a new raster (view may have changed).
    fn redraw(&mut self, _view: &ViewState) -> anyhow::Result<()> {
        Ok(())
    }

    /// The user closed the output
    fn should_close(&self) -> bool {
        false
    }
}

/// Describe the screens a renderer would drive.
fn log_screens(screens: &[ScreenConfig]) {
    for screen in screens {
        let backend = match screen.backend {
            WindowBackend::Glfw => "glfw".to_string(),
            WindowBackend::X11 => format!(
                "x11 {}{}",
                screen.display.as_deref().unwrap_or(":0"),
                if screen.override_redirect {
                    " override-redirect"
                } else {
                    ""
                }
            ),
        };
        log::info!(
            "Render: screen {} {}x{} at ({}, {}) heading {} pitch {} roll {} [{}{}]",
            screen.index,
            screen.pixel_width,
            screen.pixel_height,
            screen.x,
            screen.y,
            screen.heading,
            screen.pitch,
            screen.roll,
            backend,
            if screen.fullscreen { ", fullscreen" } else { "" }
        );
    }
}

/// Renderer without any output; keeps track of the last presented frame.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    presented: u64,
    last_pts: Option<i64>,
}

impl HeadlessRenderer {
    pub fn new(screens: &[ScreenConfig]) -> Self {
        log_screens(screens);
        Self::default()
    }
}

impl Drop for HeadlessRenderer {
    fn drop(&mut self) {
        log::debug!(
            "Render: {} frames presented, last pts {:?}",
            self.presented,
            self.last_pts
        );
    }
}

impl Renderer for HeadlessRenderer {
    fn present(
        &mut self,
        frame: &FrameBuffer,
        _time: Timestamp,
        _view: &ViewState,
    ) -> anyhow::Result<()> {
        self.presented += 1;
        self.last_pts = Some(frame.pts);
        Ok(())
    }
}

/// Writes each presented raster to `dir/frame_NNNNNN.ppm`.
#[derive(Debug)]
pub struct SnapshotRenderer {
    dir: PathBuf,
    written: u64,
}

impl SnapshotRenderer {
    pub fn new(dir: &Path, screens: &[ScreenConfig]) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("unable to create {}", dir.display()))?;
        log_screens(screens);
        log::info!("Render: writing frames to {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }
}

impl Drop for SnapshotRenderer {
    fn drop(&mut self) {
        log::info!("Render: wrote {} frames to {}", self.written, self.dir.display());
    }
}

impl Renderer for SnapshotRenderer {
    fn present(
        &mut self,
        frame: &FrameBuffer,
        _time: Timestamp,
        _view: &ViewState,
    ) -> anyhow::Result<()> {
        let path = self.dir.join(format!("frame_{:06}.ppm", self.written));
        let file = File::create(&path)
            .with_context(|| format!("unable to create {}", path.display()))?;
        write_ppm(BufWriter::new(file), frame)
            .with_context(|| format!("unable to write {}", path.display()))?;
        self.written += 1;
        Ok(())
    }
}

fn write_ppm(mut out: impl Write, frame: &FrameBuffer) -> std::io::Result<()> {
    write!(out, "P6\n{} {}\n255\n", frame.width(), frame.height())?;
    out.write_all(frame.data())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppm_layout() {
        let mut frame = FrameBuffer::new(2, 1);
        frame.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);

        let mut out = Vec::new();
        write_ppm(&mut out, &frame).unwrap();
        assert_eq!(out, b"P6\n2 1\n255\n\x01\x02\x03\x04\x05\x06");
    }

    #[test]
    fn test_snapshot_writes_numbered_files() {
        let dir = std::env::temp_dir().join(format!("video-sphere-snapshots-{}", std::process::id()));
        let mut renderer = SnapshotRenderer::new(&dir, &[]).unwrap();
        let frame = FrameBuffer::new(4, 2);
        let view = ViewState::new(StereoMode::Mono);

        renderer.present(&frame, Timestamp::ZERO, &view).unwrap();
        renderer.present(&frame, Timestamp::ZERO, &view).unwrap();

        assert_eq!(renderer.written, 2);
        let second = std::fs::read(dir.join("frame_000001.ppm")).unwrap();
        assert_eq!(second.len(), "P6\n4 2\n255\n".len() + 4 * 2 * 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_headless_tracks_last_frame() {
        let mut renderer = HeadlessRenderer::new(&[ScreenConfig::default()]);
        let mut frame = FrameBuffer::new(1, 1);
        frame.pts = 40;

        renderer
            .present(&frame, Timestamp::ZERO, &ViewState::new(StereoMode::Mono))
            .unwrap();
        assert_eq!(renderer.presented, 1);
        assert_eq!(renderer.last_pts, Some(40));
    }
}
