//! FFmpeg-backed implementations of the source traits.
//!
//! Uses dynamic linking via `ffmpeg-next`; FFmpeg 4.0+ libraries must be
//! installed on the system.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{input, Pixel, Sample};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::resampling::Context as ResampleContext;
use ffmpeg_next::software::scaling::{context::Context as ScaleContext, flag::Flags};
use ffmpeg_next::util::frame::audio::Audio as AudioFrame;
use ffmpeg_next::util::frame::video::Video as VideoFrame;

use crate::source::{
    AudioDecoder, AudioTrack, CompressedPacket, Demuxer, MediaSource, StreamKind, VideoDecoder,
    VideoTrack,
};
use crate::Error;

/// Worst-case size of one decoded audio packet, the classic libavcodec
/// bound.
pub(crate) const MAX_AUDIO_FRAME_SIZE: usize = 192_000;

/// Opens a media container and selects at most one video and one audio
/// stream, building a decoder for each.
pub fn open_media(path: &str) -> Result<MediaSource, Error> {
    ffmpeg::init().map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to initialize FFmpeg",
        ))
    })?;

    let ictx = input(&path).map_err(|e| {
        log::error!("failed to open {}: {:?}", path, e);
        Error::Open
    })?;

    let mut video_index = None;
    let mut video = None;
    if let Some(stream) = ictx.streams().best(Type::Video) {
        let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|_| Error::Codec)?
            .decoder()
            .video()
            .map_err(|_| Error::Codec)?;

        decoder.set_threading(ffmpeg::threading::Config {
            kind: ffmpeg::threading::Type::Frame,
            count: 0,
        });

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(Error::Codec);
        }

        let scaler = ScaleContext::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(|_| Error::Codec)?;

        let frame_rate = {
            let rate = stream.avg_frame_rate();
            if rate.numerator() > 0 && rate.denominator() > 0 {
                let fps = rate.numerator() as f64 / rate.denominator() as f64;
                fps.is_finite().then_some(fps)
            } else {
                None
            }
        };

        video_index = Some(stream.index());
        video = Some(VideoTrack {
            decoder: Box::new(FfmpegVideoDecoder {
                decoder,
                scaler,
                decoded: VideoFrame::empty(),
                rgb: VideoFrame::empty(),
                width,
                height,
            }),
            width,
            height,
            frame_rate,
        });
    }

    let mut audio_index = None;
    let mut audio = None;
    if let Some(stream) = ictx.streams().best(Type::Audio) {
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|_| Error::Codec)?
            .decoder()
            .audio()
            .map_err(|_| Error::Codec)?;

        let sample_rate = decoder.rate();
        let channels = decoder.channels();

        let resampler = ResampleContext::get(
            decoder.format(),
            decoder.channel_layout(),
            sample_rate,
            Sample::I16(ffmpeg::format::sample::Type::Packed),
            decoder.channel_layout(),
            sample_rate,
        )
        .map_err(|_| Error::Codec)?;

        audio_index = Some(stream.index());
        audio = Some(AudioTrack {
            decoder: Box::new(FfmpegAudioDecoder {
                decoder,
                resampler,
                decoded: AudioFrame::empty(),
                resampled: AudioFrame::empty(),
                channels,
            }),
            sample_rate,
            channels,
            bytes_per_sample: 2,
            max_frame_size: MAX_AUDIO_FRAME_SIZE,
        });
    }

    if video.is_none() && audio.is_none() {
        return Err(Error::NoStream);
    }

    if let Some(track) = &video {
        log::info!(
            "video: {}x{} @ {:.2} fps",
            track.width,
            track.height,
            track.frame_rate.unwrap_or(0.0)
        );
    }
    if let Some(track) = &audio {
        log::info!("audio: {} Hz, {} channels", track.sample_rate, track.channels);
    }

    Ok(MediaSource {
        demuxer: Box::new(FfmpegDemuxer {
            input: ictx,
            video_index,
            audio_index,
        }),
        video,
        audio,
    })
}

struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    video_index: Option<usize>,
    audio_index: Option<usize>,
}

// SAFETY: the format context is only ever used by one thread at a time
// (the reader thread, or the controller during restart, serialized by a
// mutex in the player).
unsafe impl Send for FfmpegDemuxer {}

impl Demuxer for FfmpegDemuxer {
    fn read_packet(&mut self) -> Result<Option<CompressedPacket>, Error> {
        loop {
            let (stream, packet) = match self.input.packets().next() {
                Some((stream, packet)) => (stream, packet),
                None => return Ok(None),
            };

            let index = stream.index();
            let kind = if Some(index) == self.video_index {
                StreamKind::Video
            } else if Some(index) == self.audio_index {
                StreamKind::Audio
            } else {
                continue;
            };

            let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
            return Ok(Some(CompressedPacket {
                kind,
                data,
                pts: packet.pts(),
                dts: packet.dts(),
                keyframe: packet.is_key(),
            }));
        }
    }

    fn seek_to_start(&mut self) -> Result<(), Error> {
        self.input.seek(0, ..).map_err(|e| {
            log::error!("seek to start failed: {:?}", e);
            Error::Seek
        })
    }
}

struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    scaler: ScaleContext,
    // Both frames are reused across calls; write_rgb copies out of them.
    decoded: VideoFrame,
    rgb: VideoFrame,
    width: u32,
    height: u32,
}

// SAFETY: the decoder and scaler are only ever used from the thread that
// drives the frame pull (the host's calling thread).
unsafe impl Send for FfmpegVideoDecoder {}

impl VideoDecoder for FfmpegVideoDecoder {
    fn decode(&mut self, packet: CompressedPacket) -> Result<bool, Error> {
        let mut raw = ffmpeg::Packet::copy(&packet.data);
        raw.set_pts(packet.pts);
        raw.set_dts(packet.dts);

        self.decoder.send_packet(&raw).map_err(|_| Error::Decode)?;

        let mut complete = false;
        while self.decoder.receive_frame(&mut self.decoded).is_ok() {
            complete = true;
        }
        Ok(complete)
    }

    fn write_rgb(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.scaler
            .run(&self.decoded, &mut self.rgb)
            .map_err(|_| Error::Decode)?;

        let row_bytes = self.width as usize * 3;
        if dest.len() < row_bytes * self.height as usize {
            return Err(Error::Decode);
        }

        let stride = self.rgb.stride(0);
        let data = self.rgb.data(0);
        for row in 0..self.height as usize {
            let src = row * stride;
            dest[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&data[src..src + row_bytes]);
        }
        Ok(())
    }
}

struct FfmpegAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    resampler: ResampleContext,
    decoded: AudioFrame,
    resampled: AudioFrame,
    channels: u16,
}

// SAFETY: the decoder and resampler are owned by the audio drain thread
// after open; no other thread touches them.
unsafe impl Send for FfmpegAudioDecoder {}

impl AudioDecoder for FfmpegAudioDecoder {
    fn decode(&mut self, packet: CompressedPacket, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut raw = ffmpeg::Packet::copy(&packet.data);
        raw.set_pts(packet.pts);
        raw.set_dts(packet.dts);

        self.decoder.send_packet(&raw).map_err(|_| Error::Decode)?;

        let mut written = 0usize;
        while self.decoder.receive_frame(&mut self.decoded).is_ok() {
            if let Err(e) = self.resampler.run(&self.decoded, &mut self.resampled) {
                log::error!("resampling error: {:?}", e);
                continue;
            }

            let bytes = self.resampled.samples() * self.channels as usize * 2;
            let plane = self.resampled.data(0);
            let n = bytes.min(plane.len());
            out.extend_from_slice(&plane[..n]);
            written += n;
        }
        Ok(written)
    }
}
