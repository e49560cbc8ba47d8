//! Playback controller, reader thread, and the host-synchronous frame pull.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{AudioOutput, CpalOutput, PcmBuffer, PCM_CAPACITY_FRAMES};
use crate::queue::PacketQueue;
use crate::source::{AudioDecoder, AudioTrack, Demuxer, MediaSource, StreamKind, VideoDecoder};
use crate::Error;

/// Assumed frame rate when the stream declares none.
const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Playback state of the pipeline.
///
/// `Eof` means the container is exhausted but queued packets are still
/// draining; `Quit` is terminal and tells the background threads to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayMode {
    Stopped = 0,
    Playing = 1,
    Eof = 2,
    Quit = 3,
}

/// Atomic cell holding the [`PlayMode`].
///
/// The background threads poll it at the top of every loop iteration, so
/// eventual visibility is all the state machine needs. The reader thread's
/// single permitted write (Playing -> Eof) goes through
/// [`transition`](Self::transition) and can never clobber Quit.
pub(crate) struct PlayState(AtomicU8);

impl PlayState {
    fn new(mode: PlayMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub(crate) fn load(&self) -> PlayMode {
        match self.0.load(Ordering::Acquire) {
            0 => PlayMode::Stopped,
            1 => PlayMode::Playing,
            2 => PlayMode::Eof,
            _ => PlayMode::Quit,
        }
    }

    fn store(&self, mode: PlayMode) {
        self.0.store(mode as u8, Ordering::Release);
    }

    /// Performs `from -> to` only if the current mode is `from`.
    fn transition(&self, from: PlayMode, to: PlayMode) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Tuning knobs for the pipeline threads.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Packets the reader thread keeps buffered per stream.
    pub queue_target: usize,
    /// Sleep between background-thread iterations.
    pub poll_interval: Duration,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            queue_target: 10,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// State shared between the host thread and the background threads.
struct Shared {
    mode: PlayState,
    video_queue: PacketQueue,
    audio_queue: PacketQueue,
    pcm: Mutex<PcmBuffer>,
}

impl Shared {
    fn idle() -> Arc<Self> {
        Arc::new(Self {
            mode: PlayState::new(PlayMode::Stopped),
            video_queue: PacketQueue::new(),
            audio_queue: PacketQueue::new(),
            pcm: Mutex::new(PcmBuffer::new(0)),
        })
    }
}

struct VideoPlayback {
    decoder: Box<dyn VideoDecoder>,
    /// width x height x 3 bytes, overwritten in place by each decode.
    frame: Vec<u8>,
    width: u32,
    height: u32,
}

/// The playback pipeline.
///
/// Owns the two background threads (packet reader and audio drain) and the
/// state machine. All methods are called from the host's thread; the video
/// pull runs synchronously inside `advance_*` so the host gets at most one
/// new picture per displayed frame.
pub struct MoviePlayer {
    shared: Arc<Shared>,
    demuxer: Option<Arc<Mutex<Box<dyn Demuxer>>>>,
    video: Option<VideoPlayback>,
    sound: Option<Arc<dyn AudioOutput>>,
    reader: Option<JoinHandle<()>>,
    audio_thread: Option<JoinHandle<()>>,
    out_buffer: Option<Arc<Mutex<Vec<u8>>>>,
    time_per_frame: f64,
    frame_time: f64,
    total_time: f64,
    audio_frame_bytes: usize,
}

impl MoviePlayer {
    /// Creates a player with nothing open. The state is Stopped and all
    /// dimensions are zero until [`open_file`](Self::open_file) succeeds.
    pub fn new() -> Self {
        Self {
            shared: Shared::idle(),
            demuxer: None,
            video: None,
            sound: None,
            reader: None,
            audio_thread: None,
            out_buffer: None,
            time_per_frame: 1.0 / DEFAULT_FRAME_RATE,
            frame_time: 0.0,
            total_time: 0.0,
            audio_frame_bytes: 0,
        }
    }

    /// Opens a media file with the FFmpeg backend and default options.
    pub fn open_file(&mut self, path: &str) -> Result<(), Error> {
        self.open_file_with(path, PlayerOptions::default())
    }

    /// Opens a media file with the FFmpeg backend.
    ///
    /// If an audio stream is present a cpal output is created for it; when
    /// no output device exists the file plays video-only.
    pub fn open_file_with(&mut self, path: &str, options: PlayerOptions) -> Result<(), Error> {
        let media = crate::ffmpeg::open_media(path)?;

        let output = match &media.audio {
            Some(track) => match CpalOutput::new(track.sample_rate, track.channels) {
                Ok(output) => Some(Arc::new(output) as Arc<dyn AudioOutput>),
                Err(e) => {
                    log::warn!("audio output unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        self.open_source(media, output, options)
    }

    /// Opens an already-constructed source with an optional audio sink.
    ///
    /// This is the entry point for custom backends; `open_file` is a thin
    /// wrapper around it. On success the state machine is Playing and both
    /// background threads are running.
    pub fn open_source(
        &mut self,
        media: MediaSource,
        output: Option<Arc<dyn AudioOutput>>,
        options: PlayerOptions,
    ) -> Result<(), Error> {
        self.close_file();

        let MediaSource {
            demuxer,
            video,
            audio,
        } = media;

        // An audio stream without a sink behaves like a missing stream
        let (audio, output) = match (audio, output) {
            (Some(track), Some(output)) => (Some(track), Some(output)),
            (Some(_), None) => {
                log::warn!("audio stream present but no output sink, disabling audio");
                (None, None)
            }
            (None, _) => (None, None),
        };

        if video.is_none() && audio.is_none() {
            return Err(Error::NoStream);
        }

        self.time_per_frame = video
            .as_ref()
            .and_then(|track| track.frame_rate)
            .filter(|rate| *rate > 0.0)
            .map_or(1.0 / DEFAULT_FRAME_RATE, |rate| 1.0 / rate);

        let has_video = video.is_some();
        let has_audio = audio.is_some();

        let pcm_capacity = audio
            .as_ref()
            .map_or(0, |track| track.max_frame_size * PCM_CAPACITY_FRAMES);
        let shared = Arc::new(Shared {
            mode: PlayState::new(PlayMode::Playing),
            video_queue: PacketQueue::new(),
            audio_queue: PacketQueue::new(),
            pcm: Mutex::new(PcmBuffer::new(pcm_capacity)),
        });

        let demuxer = Arc::new(Mutex::new(demuxer));

        let reader = {
            let shared = Arc::clone(&shared);
            let demuxer = Arc::clone(&demuxer);
            let target = options.queue_target;
            let poll = options.poll_interval;
            thread::spawn(move || reader_loop(shared, demuxer, has_video, has_audio, target, poll))
        };

        let mut audio_frame_bytes = 0;
        let audio_thread = match (audio, &output) {
            (Some(track), Some(sink)) => {
                let AudioTrack {
                    decoder,
                    sample_rate,
                    channels,
                    bytes_per_sample,
                    max_frame_size,
                } = track;

                audio_frame_bytes = (self.time_per_frame * sample_rate as f64).round() as usize
                    * bytes_per_sample
                    * channels as usize;

                let shared = Arc::clone(&shared);
                let sink = Arc::clone(sink);
                let frame_bytes = audio_frame_bytes;
                let poll = options.poll_interval;
                Some(thread::spawn(move || {
                    audio_loop(shared, decoder, sink, frame_bytes, max_frame_size, poll)
                }))
            }
            _ => None,
        };

        self.video = video.map(|track| {
            let size = track.width as usize * track.height as usize * 3;
            VideoPlayback {
                decoder: track.decoder,
                frame: vec![0; size],
                width: track.width,
                height: track.height,
            }
        });
        self.shared = shared;
        self.demuxer = Some(demuxer);
        self.sound = output;
        self.reader = Some(reader);
        self.audio_thread = audio_thread;
        self.audio_frame_bytes = audio_frame_bytes;
        self.frame_time = 0.0;
        self.total_time = 0.0;

        // Prime the pull path; usually a no-op until the reader fills the
        // queue
        self.pull_frame();

        Ok(())
    }

    /// Stops playback and tears the pipeline down.
    ///
    /// Order matters: Quit is set first, both threads are joined, and only
    /// then are the queues flushed and the source released, so a background
    /// thread can never touch freed state.
    pub fn close_file(&mut self) {
        self.shared.mode.store(PlayMode::Quit);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(audio) = self.audio_thread.take() {
            let _ = audio.join();
        }
        self.shared.video_queue.flush();
        self.shared.audio_queue.flush();
        self.shared.pcm.lock().clear();
        self.demuxer = None;
        self.video = None;
        self.sound = None;
        // A fresh session starts from Stopped; Quit is terminal only for
        // the threads it shut down
        self.shared = Shared::idle();
        self.time_per_frame = 1.0 / DEFAULT_FRAME_RATE;
        self.frame_time = 0.0;
        self.total_time = 0.0;
        self.audio_frame_bytes = 0;
    }

    /// Pulls exactly one new video frame regardless of elapsed time, then
    /// copies it to the registered buffer while playing.
    pub fn advance_frame(&mut self) {
        self.pull_frame();
        self.copy_frame();
    }

    /// Advances playback by `dt` seconds of wall-clock time.
    ///
    /// Every frame interval spanned by the accumulated time is decoded;
    /// intermediate frames are discarded and only the last one is copied
    /// out, so the displayed picture is the most recent decodable frame at
    /// or before the total elapsed time.
    pub fn advance_time(&mut self, dt: f64) {
        if self.demuxer.is_none() {
            return;
        }
        self.frame_time += dt;
        self.total_time += dt;

        let mut pulled = false;
        while self.frame_time > self.time_per_frame {
            self.frame_time -= self.time_per_frame;
            pulled |= self.pull_frame();
        }
        if pulled {
            self.copy_frame();
        }
    }

    /// Rewinds to the start of the stream and resumes playing.
    ///
    /// Both queues and the accumulation buffer are flushed before the seek
    /// since their packets reference the old stream position; the queues
    /// are empty when this returns and the reader refills them from the
    /// first packet.
    pub fn restart(&mut self) -> Result<(), Error> {
        let Some(demuxer) = self.demuxer.clone() else {
            return Ok(());
        };

        // Park the state machine so the reader stops enqueuing, then flush
        // everything downstream of the demuxer
        self.shared.mode.store(PlayMode::Stopped);
        {
            let mut demuxer = demuxer.lock();
            self.shared.video_queue.flush();
            self.shared.audio_queue.flush();
            self.shared.pcm.lock().clear();
            demuxer.seek_to_start()?;
        }

        self.frame_time = 0.0;
        self.total_time = 0.0;
        self.shared.mode.store(PlayMode::Playing);

        // Re-prime; usually a no-op until the reader refills the queue
        self.pull_frame();
        Ok(())
    }

    /// Current playback state.
    pub fn play_mode(&self) -> PlayMode {
        self.shared.mode.load()
    }

    pub fn width(&self) -> u32 {
        self.video.as_ref().map_or(0, |video| video.width)
    }

    pub fn height(&self) -> u32 {
        self.video.as_ref().map_or(0, |video| video.height)
    }

    /// Size in bytes of one RGB24 output frame.
    pub fn data_size(&self) -> usize {
        self.video.as_ref().map_or(0, |video| video.frame.len())
    }

    /// Seconds of playback represented by one video frame.
    pub fn time_per_frame(&self) -> f64 {
        self.time_per_frame
    }

    /// Seconds fed to [`advance_time`](Self::advance_time) since the last
    /// open or restart.
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Registers the buffer `advance_*` copies each new frame into.
    pub fn set_video_buffer(&mut self, buffer: Arc<Mutex<Vec<u8>>>) {
        self.out_buffer = Some(buffer);
    }

    /// Handle to the audio output, if an audio stream is playing.
    pub fn sound_output(&self) -> Option<Arc<dyn AudioOutput>> {
        self.sound.clone()
    }

    /// The most recently decoded picture (RGB24), if a video track is open.
    pub fn frame(&self) -> Option<&[u8]> {
        self.video.as_ref().map(|video| video.frame.as_slice())
    }

    /// Packets currently buffered in the (video, audio) queues.
    pub fn buffered_packets(&self) -> (usize, usize) {
        (
            self.shared.video_queue.len(),
            self.shared.audio_queue.len(),
        )
    }

    /// Dequeues and decodes one video packet. Returns true when a new
    /// picture landed in the frame buffer.
    fn pull_frame(&mut self) -> bool {
        match self.shared.mode.load() {
            PlayMode::Playing | PlayMode::Eof => {}
            _ => return false,
        }

        let Some(packet) = self.shared.video_queue.pop() else {
            if self.shared.mode.load() == PlayMode::Eof && self.drained() {
                self.shared.mode.transition(PlayMode::Eof, PlayMode::Stopped);
            }
            return false;
        };

        let Some(video) = self.video.as_mut() else {
            return false;
        };

        match video.decoder.decode(packet) {
            Ok(true) => match video.decoder.write_rgb(&mut video.frame) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("frame conversion failed: {}", e);
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                // Non-fatal: the frame buffer keeps its previous contents
                log::debug!("video packet dropped: {}", e);
                false
            }
        }
    }

    /// True once nothing decodable remains after end of container.
    fn drained(&self) -> bool {
        if self.video.is_some() {
            // The video queue is already known to be empty at the call site
            true
        } else {
            self.shared.audio_queue.is_empty()
                && self.shared.pcm.lock().len() < self.audio_frame_bytes.max(1)
        }
    }

    /// Copies the current picture into the host's registered buffer. Only
    /// while playing; a stale frame is never copied once the stream
    /// stopped.
    fn copy_frame(&self) {
        if self.shared.mode.load() != PlayMode::Playing {
            return;
        }
        let (Some(video), Some(target)) = (self.video.as_ref(), self.out_buffer.as_ref()) else {
            return;
        };
        let mut dest = target.lock();
        let n = dest.len().min(video.frame.len());
        dest[..n].copy_from_slice(&video.frame[..n]);
    }
}

impl Default for MoviePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MoviePlayer {
    fn drop(&mut self) {
        self.close_file();
    }
}

impl std::fmt::Debug for MoviePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoviePlayer")
            .field("mode", &self.play_mode())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("time_per_frame", &self.time_per_frame)
            .finish_non_exhaustive()
    }
}

/// Keeps both packet queues topped up to the target occupancy while the
/// pipeline is playing.
///
/// The only state write this thread may perform is Playing -> Eof when the
/// container runs out; every other transition belongs to the controller.
fn reader_loop(
    shared: Arc<Shared>,
    demuxer: Arc<Mutex<Box<dyn Demuxer>>>,
    has_video: bool,
    has_audio: bool,
    queue_target: usize,
    poll: Duration,
) {
    loop {
        match shared.mode.load() {
            PlayMode::Quit => break,
            PlayMode::Playing => loop {
                if shared.mode.load() != PlayMode::Playing {
                    break;
                }
                let need_video = has_video && shared.video_queue.len() < queue_target;
                let need_audio = has_audio && shared.audio_queue.len() < queue_target;
                if !need_video && !need_audio {
                    break;
                }

                let next = demuxer.lock().read_packet();
                match next {
                    Ok(Some(packet)) => match packet.kind {
                        StreamKind::Video if has_video => shared.video_queue.push(packet),
                        StreamKind::Audio if has_audio => shared.audio_queue.push(packet),
                        _ => {}
                    },
                    Ok(None) => {
                        shared.mode.transition(PlayMode::Playing, PlayMode::Eof);
                        break;
                    }
                    Err(e) => {
                        log::warn!("demux error, ending playback: {}", e);
                        shared.mode.transition(PlayMode::Playing, PlayMode::Eof);
                        break;
                    }
                }
            },
            _ => {}
        }
        thread::sleep(poll);
    }
}

/// Decodes queued audio packets into the accumulation buffer and forwards
/// fixed-size frames to the output whenever it reports ready.
///
/// The buffer lock is never held across a decode or an output call, so
/// decode latency cannot block the drain path or vice versa.
fn audio_loop(
    shared: Arc<Shared>,
    mut decoder: Box<dyn AudioDecoder>,
    output: Arc<dyn AudioOutput>,
    frame_bytes: usize,
    max_frame_size: usize,
    poll: Duration,
) {
    let mut scratch: Vec<u8> = Vec::with_capacity(max_frame_size);
    let mut frame = vec![0u8; frame_bytes];

    loop {
        match shared.mode.load() {
            PlayMode::Quit => break,
            PlayMode::Playing | PlayMode::Eof => {
                // Decode: move queued packets into the accumulation buffer
                while shared.pcm.lock().spare() >= max_frame_size {
                    let Some(packet) = shared.audio_queue.pop() else {
                        break;
                    };
                    scratch.clear();
                    match decoder.decode(packet, &mut scratch) {
                        Ok(_) => {
                            shared.pcm.lock().append(&scratch);
                        }
                        Err(e) => log::debug!("audio packet dropped: {}", e),
                    }
                }

                // Drain: feed the device while it has room
                while output.is_ready() {
                    {
                        let mut pcm = shared.pcm.lock();
                        if !pcm.consume(&mut frame) {
                            break;
                        }
                    }
                    output.queue(&frame);
                }
            }
            PlayMode::Stopped => {}
        }
        thread::sleep(poll);
    }
}
