//! Decoded-PCM accumulation and the audio output boundary.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::Error;

/// Accumulation-buffer capacity in worst-case decoded packets.
pub(crate) const PCM_CAPACITY_FRAMES: usize = 6;

/// Frames buffered toward the device before `is_ready` reports false.
const OUTPUT_QUEUE_DEPTH: usize = 4;

/// Linear accumulation buffer for decoded PCM not yet delivered to the
/// output device.
///
/// Fixed capacity; appends beyond it are truncated, never overflowed.
/// The consumer removes bytes from the head and the remainder is shifted
/// down, so byte order is strictly FIFO.
pub struct PcmBuffer {
    data: Vec<u8>,
    len: usize,
}

impl PcmBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of spare capacity remaining.
    pub fn spare(&self) -> usize {
        self.data.len() - self.len
    }

    /// Appends bytes at the tail, truncating at capacity. Returns the
    /// number of bytes actually stored.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let stored = bytes.len().min(self.spare());
        self.data[self.len..self.len + stored].copy_from_slice(&bytes[..stored]);
        self.len += stored;
        stored
    }

    /// Removes exactly `dest.len()` bytes from the head, shifting the
    /// remainder down. Returns false (and removes nothing) if fewer bytes
    /// are buffered.
    pub fn consume(&mut self, dest: &mut [u8]) -> bool {
        let wanted = dest.len();
        if wanted > self.len {
            return false;
        }
        dest.copy_from_slice(&self.data[..wanted]);
        self.data.copy_within(wanted..self.len, 0);
        self.len -= wanted;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// The audio output device, as seen by the drain thread.
///
/// One `queue` call carries exactly one video frame's worth of interleaved
/// signed 16-bit little-endian PCM.
pub trait AudioOutput: Send + Sync {
    /// True when the device can accept another frame of samples.
    fn is_ready(&self) -> bool;

    /// Hands the device one frame's worth of PCM.
    fn queue(&self, pcm: &[u8]);
}

/// cpal-backed audio output.
///
/// Frames travel over a bounded channel into the cpal callback, which
/// converts s16le to the device's f32 samples and plays silence on
/// underrun. The stream itself lives on a dedicated thread because cpal
/// streams cannot move between threads.
pub struct CpalOutput {
    frames: Sender<Vec<u8>>,
    shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, Error> {
        let (frame_tx, frame_rx) = bounded::<Vec<u8>>(OUTPUT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), Error>>(1);

        let worker = thread::spawn(move || {
            let stream = match build_stream(sample_rate, channels, frame_rx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Keep the stream alive until shutdown; cpal invokes the
            // callback on its own thread.
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames: frame_tx,
                shutdown: shutdown_tx,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::AudioDevice)
            }
        }
    }
}

impl AudioOutput for CpalOutput {
    fn is_ready(&self) -> bool {
        !self.frames.is_full()
    }

    fn queue(&self, pcm: &[u8]) {
        if self.frames.try_send(pcm.to_vec()).is_err() {
            log::trace!("audio output full, frame dropped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_stream(
    sample_rate: u32,
    channels: u16,
    frame_rx: Receiver<Vec<u8>>,
) -> Result<cpal::Stream, Error> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(Error::AudioDevice)?;

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };

    log::info!("audio output: {} Hz, {} channels", sample_rate, channels);

    let mut pending: VecDeque<u8> = VecDeque::new();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    if pending.len() < 2 {
                        if let Ok(bytes) = frame_rx.try_recv() {
                            pending.extend(bytes);
                        }
                    }
                    match (pending.pop_front(), pending.pop_front()) {
                        (Some(lo), Some(hi)) => {
                            *slot = i16::from_le_bytes([lo, hi]) as f32 / 32768.0;
                        }
                        _ => *slot = 0.0,
                    }
                }
            },
            |err| log::error!("audio stream error: {:?}", err),
            None,
        )
        .map_err(|_| Error::AudioDevice)?;

    stream.play().map_err(|_| Error::AudioDevice)?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume_fifo() {
        let mut buf = PcmBuffer::new(16);
        assert_eq!(buf.append(&[1, 2, 3, 4]), 4);
        assert_eq!(buf.append(&[5, 6]), 2);
        assert_eq!(buf.len(), 6);

        let mut out = [0u8; 4];
        assert!(buf.consume(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buf.len(), 2);

        // Remainder was shifted down and stays in order
        let mut rest = [0u8; 2];
        assert!(buf.consume(&mut rest));
        assert_eq!(rest, [5, 6]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_append_truncates_at_capacity() {
        let mut buf = PcmBuffer::new(8);
        assert_eq!(buf.append(&[0; 6]), 6);
        assert_eq!(buf.append(&[1; 6]), 2);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.spare(), 0);

        // Completely full buffer rejects everything
        assert_eq!(buf.append(&[2; 4]), 0);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_consume_requires_enough_bytes() {
        let mut buf = PcmBuffer::new(8);
        buf.append(&[1, 2, 3]);

        let mut out = [0u8; 4];
        assert!(!buf.consume(&mut out));
        // Failed consume removes nothing
        assert_eq!(buf.len(), 3);

        let mut out = [0u8; 3];
        assert!(buf.consume(&mut out));
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_interleaved_appends_and_consumes_keep_order() {
        let mut buf = PcmBuffer::new(32);
        let mut expected: Vec<u8> = Vec::new();
        let mut drained: Vec<u8> = Vec::new();

        for round in 0u8..8 {
            let chunk = [round * 3, round * 3 + 1, round * 3 + 2];
            buf.append(&chunk);
            expected.extend_from_slice(&chunk);

            if round % 2 == 1 {
                let mut out = [0u8; 4];
                assert!(buf.consume(&mut out));
                drained.extend_from_slice(&out);
            }
        }
        let mut rest = vec![0u8; buf.len()];
        assert!(buf.consume(&mut rest));
        drained.extend_from_slice(&rest);

        assert_eq!(drained, expected);
    }

    #[test]
    fn test_clear_resets_length_only() {
        let mut buf = PcmBuffer::new(8);
        buf.append(&[9; 5]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.spare(), 8);
    }
}
