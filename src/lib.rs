//! A threaded audio/video decode pipeline for real-time render loops,
//! built on top of FFmpeg.
//!
//! [`MoviePlayer`] opens a media container, demultiplexes it into
//! elementary streams, and decodes off the main thread. The host drives
//! playback by calling [`MoviePlayer::advance_time`] (or
//! [`MoviePlayer::advance_frame`]) once per displayed frame and reads the
//! decoded RGB24 image out of a registered buffer; audio is decoded and
//! pushed to the output device continuously in the background.
//!
//! Two background threads cooperate with the host's calling thread: a
//! reader that keeps the per-stream packet queues topped up, and an audio
//! drain that turns queued packets into PCM and feeds the device. All
//! waiting is bounded polling; shutdown joins both threads before any
//! shared state is released, so teardown can never race a decode.
//!
//! # Prerequisites
//!
//! FFmpeg 4.0+ libraries must be installed on your system:
//! - **macOS**: `brew install ffmpeg`
//! - **Ubuntu/Debian**: `apt-get install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev libswresample-dev`
//! - **Arch Linux**: `pacman -S ffmpeg`
//! - **Windows**: Download FFmpeg shared libraries from [ffmpeg.org](https://ffmpeg.org/download.html)
//!
//! The library uses dynamic linking for LGPL compliance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use moviepipe::{MoviePlayer, Mutex, PlayMode};
//!
//! let mut player = MoviePlayer::new();
//! player.open_file("intro.mp4").expect("failed to open video");
//!
//! let frame = Arc::new(Mutex::new(vec![0u8; player.data_size()]));
//! player.set_video_buffer(Arc::clone(&frame));
//!
//! // Inside the render loop, once per displayed frame:
//! let dt = 1.0 / 60.0;
//! while player.play_mode() != PlayMode::Stopped {
//!     player.advance_time(dt);
//!     // upload `frame` to a texture, render, present...
//! }
//! player.close_file();
//! ```
//!
//! # Custom backends
//!
//! The pipeline is written against its source traits: a [`Demuxer`] plus
//! per-stream [`VideoDecoder`] / [`AudioDecoder`] implementations.
//! [`open_media`] builds the FFmpeg-backed bundle;
//! [`MoviePlayer::open_source`] accepts any other implementation, which is
//! also how the test suite drives the player without media files.

mod audio;
mod error;
mod ffmpeg;
mod player;
mod queue;
mod source;

pub use audio::{AudioOutput, CpalOutput, PcmBuffer};
pub use error::Error;
pub use ffmpeg::open_media;
pub use player::{MoviePlayer, PlayMode, PlayerOptions};
pub use queue::PacketQueue;
pub use source::{
    AudioDecoder, AudioTrack, CompressedPacket, Demuxer, MediaSource, StreamKind, VideoDecoder,
    VideoTrack,
};

// Re-export commonly used types
pub use parking_lot::Mutex;
