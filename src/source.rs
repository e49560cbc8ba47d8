//! Boundary between the pipeline and the demux/decode backend.
//!
//! The pipeline is written against these traits. [`crate::ffmpeg`] provides
//! the FFmpeg-backed implementation; hosts may substitute their own backend
//! (the test suite drives the player with in-memory fakes).

use crate::Error;

/// Which elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One compressed, demuxed chunk of a single elementary stream.
///
/// The packet owns its payload. Whichever queue currently holds it has
/// exclusive ownership; decoding consumes the packet and releases the
/// backing memory.
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    pub kind: StreamKind,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub keyframe: bool,
}

impl CompressedPacket {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Pulls packets out of an open container in decode order.
pub trait Demuxer: Send {
    /// Reads the next packet belonging to a selected stream.
    ///
    /// Returns `Ok(None)` at end of container. Packets for streams other
    /// than the selected video/audio pair are skipped internally.
    fn read_packet(&mut self) -> Result<Option<CompressedPacket>, Error>;

    /// Rewinds the container to its first packet.
    fn seek_to_start(&mut self) -> Result<(), Error>;
}

/// Decodes video packets into an internal picture, read out as RGB24.
///
/// The decoder reuses one internal frame object across calls; callers must
/// copy the picture out with [`write_rgb`](Self::write_rgb) before the next
/// [`decode`](Self::decode), and must never retain a reference across calls.
pub trait VideoDecoder: Send {
    /// Feeds one packet. Returns `true` when a complete picture is held.
    fn decode(&mut self, packet: CompressedPacket) -> Result<bool, Error>;

    /// Converts the held picture to RGB24 into `dest` (width x height x 3
    /// bytes). Only valid after a [`decode`](Self::decode) returned `true`.
    fn write_rgb(&mut self, dest: &mut [u8]) -> Result<(), Error>;
}

/// Decodes audio packets into interleaved signed 16-bit little-endian PCM.
pub trait AudioDecoder: Send {
    /// Feeds one packet, appending decoded bytes to `out`. Returns the
    /// number of bytes appended (codec-dependent, possibly zero).
    fn decode(&mut self, packet: CompressedPacket, out: &mut Vec<u8>) -> Result<usize, Error>;
}

/// A selected video stream and its decoder.
pub struct VideoTrack {
    pub decoder: Box<dyn VideoDecoder>,
    pub width: u32,
    pub height: u32,
    /// Declared frame rate, if the container provides a usable one.
    pub frame_rate: Option<f64>,
}

/// A selected audio stream and its decoder.
pub struct AudioTrack {
    pub decoder: Box<dyn AudioDecoder>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: usize,
    /// Worst-case size in bytes of one decoded packet.
    pub max_frame_size: usize,
}

/// An opened container: one demuxer plus at most one track of each kind.
pub struct MediaSource {
    pub demuxer: Box<dyn Demuxer>,
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}
