//! Control messages exchanged between the authority and its subscribers
//!
//! Every payload starts with a one-byte ASCII tag, except the literal
//! greeting `HELLO` a subscriber sends once after connecting.

use bytes::Bytes;

use super::message::{MessageReader, MessageWriter, ParseError};
use crate::assets::GREETING;
use crate::pipeline::types::Timestamp;

pub const TAG_PATH: u8 = b'P';
pub const TAG_SEEK: u8 = b'S';
pub const TAG_TIME_SYNC: u8 = b'T';
pub const TAG_ORIENTATION: u8 = b'O';
pub const TAG_PAUSE_TOGGLE: u8 = b'Z';
pub const TAG_SHADER_TOGGLE: u8 = b'X';

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Subscriber bootstrap; answered with `Path` then `TimeSync`
    Greeting,
    /// Media to open, with the authority's decoded raster size when known
    Path {
        path: String,
        dimensions: Option<(u32, u32)>,
    },
    /// Jump the playback clock (and decoder) to a stream time
    Seek(Timestamp),
    /// Authority's current stream time, for cheap clock correction
    TimeSync(Timestamp),
    /// Shared view orientation in radians
    Orientation { pitch: f32, yaw: f32 },
    PauseToggle,
    ShaderToggle,
}

impl Command {
    pub fn encode(&self) -> Bytes {
        let writer = match self {
            Command::Greeting => {
                let mut writer = MessageWriter::new();
                writer.write_bytes(GREETING);
                writer
            }
            Command::Path { path, dimensions } => {
                let mut writer = MessageWriter::with_tag(TAG_PATH);
                writer.write_string(path);
                if let Some((width, height)) = dimensions {
                    writer.write_u32(*width).write_u32(*height);
                }
                writer
            }
            Command::Seek(target) => {
                let mut writer = MessageWriter::with_tag(TAG_SEEK);
                writer.write_i64(target.micros);
                writer
            }
            Command::TimeSync(now) => {
                let mut writer = MessageWriter::with_tag(TAG_TIME_SYNC);
                writer.write_i64(now.micros);
                writer
            }
            Command::Orientation { pitch, yaw } => {
                let mut writer = MessageWriter::with_tag(TAG_ORIENTATION);
                writer.write_f32(*pitch).write_f32(*yaw);
                writer
            }
            Command::PauseToggle => MessageWriter::with_tag(TAG_PAUSE_TOGGLE),
            Command::ShaderToggle => MessageWriter::with_tag(TAG_SHADER_TOGGLE),
        };
        writer.freeze()
    }

    /// Parse one complete payload; the payload must be consumed exactly.
    pub fn decode(payload: Bytes) -> Result<Self, ParseError> {
        if payload.is_empty() {
            return Err(ParseError::Empty);
        }
        if payload.as_ref() == GREETING {
            return Ok(Command::Greeting);
        }

        let mut reader = MessageReader::new(payload);
        let command = match reader.read_u8()? {
            TAG_PATH => {
                let path = reader.read_string()?;
                let dimensions = if reader.remaining() > 0 {
                    Some((reader.read_u32()?, reader.read_u32()?))
                } else {
                    None
                };
                Command::Path { path, dimensions }
            }
            TAG_SEEK => Command::Seek(Timestamp::from_micros(reader.read_i64()?)),
            TAG_TIME_SYNC => Command::TimeSync(Timestamp::from_micros(reader.read_i64()?)),
            TAG_ORIENTATION => Command::Orientation {
                pitch: reader.read_f32()?,
                yaw: reader.read_f32()?,
            },
            TAG_PAUSE_TOGGLE => Command::PauseToggle,
            TAG_SHADER_TOGGLE => Command::ShaderToggle,
            tag => return Err(ParseError::UnknownTag(tag)),
        };

        reader.finish()?;
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Greeting => "greeting",
            Command::Path { .. } => "path",
            Command::Seek(_) => "seek",
            Command::TimeSync(_) => "time-sync",
            Command::Orientation { .. } => "orientation",
            Command::PauseToggle => "pause-toggle",
            Command::ShaderToggle => "shader-toggle",
        }
    }
}
