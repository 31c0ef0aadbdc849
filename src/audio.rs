//! Capture and render capabilities.
//!
//! The control loop only sees [`AudioCapture`] and [`AudioRender`]. Live
//! audio goes through cpal; offline runs replay a WAV recording as the
//! ambient source and record the masking output with hound.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};
use hound::{WavReader, WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::config::{full_scale, Config};
use crate::error::{CaptureError, RenderError};
use crate::level::SampleBuffer;

/// Source of ambient-noise frames. `capture` blocks until a full frame is
/// available or the transfer fails.
pub trait AudioCapture {
    fn capture(&mut self) -> Result<SampleBuffer, CaptureError>;
}

/// Sink for masking frames. `render` blocks until the frame is accepted.
pub trait AudioRender {
    fn render(&mut self, buffer: SampleBuffer) -> Result<(), RenderError>;

    /// Drop anything still queued for output. Called when the loop stops
    /// or faults so no further masking audio is produced.
    fn halt(&mut self) {}
}

impl<C: AudioCapture + ?Sized> AudioCapture for Box<C> {
    fn capture(&mut self) -> Result<SampleBuffer, CaptureError> {
        (**self).capture()
    }
}

impl<R: AudioRender + ?Sized> AudioRender for Box<R> {
    fn render(&mut self, buffer: SampleBuffer) -> Result<(), RenderError> {
        (**self).render(buffer)
    }

    fn halt(&mut self) {
        (**self).halt()
    }
}

/// Last error reported by a cpal stream callback, picked up by the loop thread.
#[derive(Debug, Clone, Default)]
struct StreamErrorSlot(Arc<Mutex<Option<String>>>);

impl StreamErrorSlot {
    fn store(&self, message: String) {
        match self.0.lock() {
            Ok(mut guard) => *guard = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
    }

    fn take(&self) -> Option<String> {
        match self.0.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

fn pick_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, String> {
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| e.to_string())?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| format!("input device not found: {name}")),
        None => host
            .default_input_device()
            .ok_or_else(|| "no default input device".to_string()),
    }
}

fn pick_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, String> {
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| e.to_string())?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| format!("output device not found: {name}")),
        None => host
            .default_output_device()
            .ok_or_else(|| "no default output device".to_string()),
    }
}

/// Find a stream config that runs at exactly `rate`, preferring the
/// device's default sample format.
///
/// The noise filters and the tick/frame timing are laid out for the
/// configured rate, so a device that cannot run at it is not used.
fn config_at_rate<I>(ranges: I, preferred_format: SampleFormat, rate: u32) -> Option<SupportedStreamConfig>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    let mut candidates: Vec<SupportedStreamConfig> = ranges
        .into_iter()
        .filter_map(|range| range.try_with_sample_rate(cpal::SampleRate(rate)))
        .collect();
    match candidates.iter().position(|c| c.sample_format() == preferred_format) {
        Some(i) => Some(candidates.swap_remove(i)),
        None => candidates.into_iter().next(),
    }
}

/// Names of the available input and output devices.
pub fn list_devices() -> (Vec<String>, Vec<String>) {
    let host = cpal::default_host();
    let inputs: Vec<String> = host
        .input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default();
    let outputs: Vec<String> = host
        .output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default();
    (inputs, outputs)
}

/// Cuts the mono chunks sent by the input callback into frames of a fixed
/// length. Only the newest frame is kept; older audio is stale by the time
/// the loop asks for it.
struct FrameAssembler {
    chunks: Receiver<Vec<f32>>,
    pending: VecDeque<f32>,
    frame_len: usize,
    bits_per_sample: u8,
    timeout: Duration,
    error: StreamErrorSlot,
}

impl FrameAssembler {
    fn new(chunks: Receiver<Vec<f32>>, config: &Config, error: StreamErrorSlot) -> Self {
        Self {
            chunks,
            pending: VecDeque::with_capacity(config.capture_buffer_size * 2),
            frame_len: config.capture_buffer_size,
            bits_per_sample: config.bits_per_sample,
            timeout: config.io_timeout(),
            error,
        }
    }

    /// Keep only the newest `frame_len` samples.
    fn trim_stale(&mut self) {
        let excess = self.pending.len().saturating_sub(self.frame_len);
        self.pending.drain(..excess);
    }

    fn next_frame(&mut self) -> Result<SampleBuffer, CaptureError> {
        if let Some(message) = self.error.take() {
            return Err(CaptureError::Stream(message));
        }

        while let Ok(chunk) = self.chunks.try_recv() {
            self.pending.extend(chunk);
        }
        self.trim_stale();

        let deadline = Instant::now() + self.timeout;
        while self.pending.len() < self.frame_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.chunks.recv_timeout(remaining) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CaptureError::Timeout(self.timeout.as_millis() as u64));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::DeviceUnavailable("input stream closed".into()));
                }
            }
            if let Some(message) = self.error.take() {
                return Err(CaptureError::Stream(message));
            }
        }

        let frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
        Ok(SampleBuffer::from_normalized(&frame, self.bits_per_sample))
    }
}

/// Microphone capture through cpal. The input callback downmixes to mono
/// and forwards chunks over a bounded channel.
pub struct CpalCapture {
    _stream: Stream,
    frames: FrameAssembler,
}

impl CpalCapture {
    pub fn open(config: &Config, device_name: Option<&str>) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = pick_input_device(&host, device_name).map_err(CaptureError::DeviceUnavailable)?;
        let name = device.name().unwrap_or_default();

        let default_format = device
            .default_input_config()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .sample_format();
        let ranges = device
            .supported_input_configs()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        let supported = config_at_rate(ranges, default_format, config.sample_rate).ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "{name} cannot capture at {} Hz",
                config.sample_rate
            ))
        })?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.config();
        info!(
            device = %name,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = %sample_format,
            "opening capture device"
        );

        // a few frames of slack; older audio is discarded on capture anyway
        let (tx, rx) = mpsc::sync_channel(64);
        let error = StreamErrorSlot::default();

        let stream = build_capture_stream(&device, &stream_config, sample_format, tx, error.clone())?;
        stream
            .play()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            frames: FrameAssembler::new(rx, config, error),
        })
    }
}

fn build_capture_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    tx: SyncSender<Vec<f32>>,
    error: StreamErrorSlot,
) -> Result<Stream, CaptureError> {
    match format {
        SampleFormat::F32 => build_input_stream::<f32>(device, config, tx, error),
        SampleFormat::I16 => build_input_stream::<i16>(device, config, tx, error),
        SampleFormat::U16 => build_input_stream::<u16>(device, config, tx, error),
        SampleFormat::I32 => build_input_stream::<i32>(device, config, tx, error),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "unsupported input sample format {other}"
        ))),
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: SyncSender<Vec<f32>>,
    error: StreamErrorSlot,
) -> Result<Stream, CaptureError>
where
    T: Sample + SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = move |err: cpal::StreamError| error.store(err.to_string());

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32)
                    .collect();
                // a full channel means capture is lagging; drop the chunk
                let _ = tx.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))
}

impl AudioCapture for CpalCapture {
    fn capture(&mut self) -> Result<SampleBuffer, CaptureError> {
        self.frames.next_frame()
    }
}

/// Normalized mono samples waiting for the output callback. `push` blocks
/// while more than `high_water` samples are queued, so the device paces
/// the loop.
#[derive(Debug, Clone)]
struct RenderQueue {
    samples: Arc<Mutex<VecDeque<f32>>>,
    high_water: usize,
    timeout: Duration,
    error: StreamErrorSlot,
}

impl RenderQueue {
    fn new(high_water: usize, timeout: Duration, error: StreamErrorSlot) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::new())),
            high_water,
            timeout,
            error,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        match self.samples.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn push(&self, samples: Vec<f32>) -> Result<(), RenderError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(message) = self.error.take() {
                return Err(RenderError::Stream(message));
            }
            if self.len() <= self.high_water {
                break;
            }
            if Instant::now() >= deadline {
                return Err(RenderError::Timeout(self.timeout.as_millis() as u64));
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.lock().extend(samples);
        Ok(())
    }

    /// Fill an interleaved output buffer, copying each mono sample to every
    /// channel. Plays silence once the queue runs dry.
    fn fill<T>(&self, data: &mut [T], channels: usize)
    where
        T: Sample + FromSample<f32>,
    {
        let mut q = self.lock();
        for frame in data.chunks_mut(channels.max(1)) {
            let s = q.pop_front().unwrap_or(0.0);
            let sample = T::from_sample(s.clamp(-1.0, 1.0));
            for ch in frame.iter_mut() {
                *ch = sample;
            }
        }
    }

    /// Drop everything queued; returns how many samples were dropped.
    fn clear(&self) -> usize {
        let mut q = self.lock();
        let dropped = q.len();
        q.clear();
        dropped
    }
}

/// Speaker output through cpal.
pub struct CpalRender {
    _stream: Stream,
    queue: RenderQueue,
}

impl CpalRender {
    pub fn open(config: &Config, device_name: Option<&str>) -> Result<Self, RenderError> {
        let host = cpal::default_host();
        let device = pick_output_device(&host, device_name).map_err(RenderError::DeviceUnavailable)?;
        let name = device.name().unwrap_or_default();

        let default_format = device
            .default_output_config()
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?
            .sample_format();
        let ranges = device
            .supported_output_configs()
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?;
        let supported = config_at_rate(ranges, default_format, config.sample_rate).ok_or_else(|| {
            RenderError::DeviceUnavailable(format!(
                "{name} cannot render at {} Hz",
                config.sample_rate
            ))
        })?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.config();
        info!(
            device = %name,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = %sample_format,
            "opening render device"
        );

        let error = StreamErrorSlot::default();
        let queue = RenderQueue::new(config.noise_buffer_size * 2, config.io_timeout(), error.clone());

        let stream = build_render_stream(&device, &stream_config, sample_format, queue.clone(), error)?;
        stream
            .play()
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?;

        Ok(Self { _stream: stream, queue })
    }
}

fn build_render_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    queue: RenderQueue,
    error: StreamErrorSlot,
) -> Result<Stream, RenderError> {
    match format {
        SampleFormat::F32 => build_output_stream::<f32>(device, config, queue, error),
        SampleFormat::I16 => build_output_stream::<i16>(device, config, queue, error),
        SampleFormat::U16 => build_output_stream::<u16>(device, config, queue, error),
        SampleFormat::I32 => build_output_stream::<i32>(device, config, queue, error),
        other => Err(RenderError::DeviceUnavailable(format!(
            "unsupported output sample format {other}"
        ))),
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: RenderQueue,
    error: StreamErrorSlot,
) -> Result<Stream, RenderError>
where
    T: Sample + SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = move |err: cpal::StreamError| error.store(err.to_string());

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| queue.fill(data, channels),
            err_fn,
            None,
        )
        .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))
}

impl AudioRender for CpalRender {
    fn render(&mut self, buffer: SampleBuffer) -> Result<(), RenderError> {
        self.queue.push(buffer.to_normalized())
    }

    fn halt(&mut self) {
        let dropped = self.queue.clear();
        debug!(dropped, "cleared render queue");
    }
}

/// Rescale an integer sample from one bit depth to another.
fn rescale_bits(sample: i32, from_bits: u16, to_bits: u8) -> i32 {
    let from = from_bits as i32;
    let to = to_bits as i32;
    let v = sample as i64;
    let scaled = if from > to { v >> (from - to) } else { v << (to - from) };
    let max = full_scale(to_bits) as i64;
    scaled.clamp(-max, max) as i32
}

/// Replays a WAV recording as the ambient-noise source. Multi-channel files
/// use their first channel.
pub struct WavCapture {
    samples: Vec<i32>,
    position: usize,
    frame_len: usize,
    bits_per_sample: u8,
    looping: bool,
}

impl WavCapture {
    pub fn open<P: AsRef<Path>>(path: P, config: &Config, looping: bool) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        let mut reader = WavReader::new(BufReader::new(file))
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.sample_rate != config.sample_rate {
            warn!(
                file_rate = spec.sample_rate,
                configured = config.sample_rate,
                "ambient recording sample rate differs from config"
            );
        }

        let bits = config.bits_per_sample;
        let interleaved: Vec<i32> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .samples::<i32>()
                .map(|s| s.map(|v| rescale_bits(v, spec.bits_per_sample, bits)))
                .collect::<Result<Vec<i32>, _>>(),
            hound::SampleFormat::Float => {
                let max = full_scale(bits) as f32;
                reader
                    .samples::<f32>()
                    .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * max).round() as i32))
                    .collect::<Result<Vec<i32>, _>>()
            }
        }
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let channels = spec.channels.max(1) as usize;
        let samples: Vec<i32> = interleaved.chunks(channels).map(|frame| frame[0]).collect();
        info!(path = %path.display(), samples = samples.len(), "loaded ambient recording");

        Ok(Self::from_samples(samples, config, looping))
    }

    pub fn from_samples(samples: Vec<i32>, config: &Config, looping: bool) -> Self {
        Self {
            samples,
            position: 0,
            frame_len: config.capture_buffer_size,
            bits_per_sample: config.bits_per_sample,
            looping,
        }
    }
}

impl AudioCapture for WavCapture {
    fn capture(&mut self) -> Result<SampleBuffer, CaptureError> {
        let total = self.samples.len();
        if total == 0 {
            return Err(CaptureError::Exhausted);
        }

        if !self.looping {
            let end = self.position + self.frame_len;
            if end > total {
                return Err(CaptureError::Exhausted);
            }
            let frame = self.samples[self.position..end].to_vec();
            self.position = end;
            return Ok(SampleBuffer::new(frame, self.bits_per_sample));
        }

        if self.position + self.frame_len > total {
            debug!("ambient recording wrapped");
        }
        let frame: Vec<i32> = (0..self.frame_len)
            .map(|i| self.samples[(self.position + i) % total])
            .collect();
        self.position = (self.position + self.frame_len) % total;
        Ok(SampleBuffer::new(frame, self.bits_per_sample))
    }
}

/// Records the masking output to a mono WAV file.
pub struct WavRender {
    writer: Option<WavWriter<BufWriter<File>>>,
    written: usize,
}

impl WavRender {
    pub fn create<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self, RenderError> {
        if ![8, 16, 24, 32].contains(&config.bits_per_sample) {
            return Err(RenderError::DeviceUnavailable(format!(
                "WAV output needs 8, 16, 24 or 32 bits per sample, got {}",
                config.bits_per_sample
            )));
        }
        let spec = WavSpec {
            channels: 1,
            sample_rate: config.sample_rate,
            bits_per_sample: config.bits_per_sample as u16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?;
        Ok(Self { writer: Some(writer), written: 0 })
    }

    pub fn samples_written(&self) -> usize {
        self.written
    }

    /// Flush the header and close the file.
    pub fn finalize(mut self) -> Result<(), RenderError> {
        match self.writer.take() {
            Some(writer) => writer.finalize().map_err(|e| RenderError::Stream(e.to_string())),
            None => Ok(()),
        }
    }
}

impl AudioRender for WavRender {
    fn render(&mut self, buffer: SampleBuffer) -> Result<(), RenderError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RenderError::DeviceUnavailable("WAV writer already closed".into()))?;
        for &s in buffer.samples() {
            writer
                .write_sample(s)
                .map_err(|e| RenderError::Stream(e.to_string()))?;
        }
        self.written += buffer.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config { capture_buffer_size: 4, ..Config::default() }
    }

    #[test]
    fn test_rescale_bits() {
        assert_eq!(rescale_bits(256, 16, 8), 1);
        assert_eq!(rescale_bits(1, 8, 16), 256);
        assert_eq!(rescale_bits(-32768, 16, 16), -32767, "clamped to symmetric full scale");
        assert_eq!(rescale_bits(8_388_607, 24, 16), 32767);
    }

    #[test]
    fn test_wav_capture_frames() {
        let mut capture = WavCapture::from_samples((1..=10).collect(), &cfg(), false);
        assert_eq!(capture.capture().unwrap().samples(), &[1, 2, 3, 4]);
        assert_eq!(capture.capture().unwrap().samples(), &[5, 6, 7, 8]);
        assert_eq!(capture.capture(), Err(CaptureError::Exhausted));
    }

    #[test]
    fn test_wav_capture_exhausts_on_exact_multiple() {
        let mut capture = WavCapture::from_samples(vec![7; 8], &cfg(), false);
        assert_eq!(capture.capture().unwrap().samples(), &[7; 4]);
        assert_eq!(capture.capture().unwrap().samples(), &[7; 4]);
        for _ in 0..3 {
            assert_eq!(
                capture.capture(),
                Err(CaptureError::Exhausted),
                "a non-looping recording must not wrap back to the start"
            );
        }

        let mut capture = WavCapture::from_samples(vec![7; 1024], &Config::default(), false);
        let frames = (0..10).take_while(|_| capture.capture().is_ok()).count();
        assert_eq!(frames, 2, "1024 samples at 512 per frame");
    }

    #[test]
    fn test_wav_capture_looping() {
        let mut capture = WavCapture::from_samples((1..=6).collect(), &cfg(), true);
        assert_eq!(capture.capture().unwrap().samples(), &[1, 2, 3, 4]);
        assert_eq!(capture.capture().unwrap().samples(), &[5, 6, 1, 2]);
        assert_eq!(capture.capture().unwrap().samples(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_wav_render_then_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masking.wav");
        let config = cfg();

        let mut render = WavRender::create(&path, &config).unwrap();
        render.render(SampleBuffer::new(vec![100, -200, 300, -400], 16)).unwrap();
        render.render(SampleBuffer::new(vec![1, 2, 3, 4], 16)).unwrap();
        assert_eq!(render.samples_written(), 8);
        render.finalize().unwrap();

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, config.sample_rate);
        assert_eq!(reader.spec().bits_per_sample, 16);

        let mut capture = WavCapture::open(&path, &config, false).unwrap();
        assert_eq!(capture.capture().unwrap().samples(), &[100, -200, 300, -400]);
        assert_eq!(capture.capture().unwrap().samples(), &[1, 2, 3, 4]);
        assert_eq!(capture.capture(), Err(CaptureError::Exhausted));
    }

    #[test]
    fn test_wav_render_rejects_odd_bit_depth() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { bits_per_sample: 12, ..cfg() };
        assert!(WavRender::create(dir.path().join("x.wav"), &config).is_err());
    }

    fn range(min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            2,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_config_at_rate_requires_exact_rate() {
        let ranges = vec![range(44_100, 48_000, SampleFormat::F32)];
        assert!(
            config_at_rate(ranges, SampleFormat::F32, 16_000).is_none(),
            "no silent fallback to another rate"
        );

        let ranges = vec![
            range(44_100, 48_000, SampleFormat::F32),
            range(8_000, 48_000, SampleFormat::I16),
        ];
        let chosen = config_at_rate(ranges, SampleFormat::F32, 16_000).unwrap();
        assert_eq!(chosen.sample_rate(), cpal::SampleRate(16_000));
        assert_eq!(chosen.sample_format(), SampleFormat::I16);
    }

    #[test]
    fn test_config_at_rate_prefers_default_format() {
        let ranges = vec![
            range(8_000, 48_000, SampleFormat::I16),
            range(8_000, 48_000, SampleFormat::F32),
        ];
        let chosen = config_at_rate(ranges, SampleFormat::F32, 16_000).unwrap();
        assert_eq!(chosen.sample_format(), SampleFormat::F32);
        assert_eq!(chosen.config().sample_rate, cpal::SampleRate(16_000));
    }

    fn assembler(timeout_ms: u64) -> (SyncSender<Vec<f32>>, FrameAssembler, StreamErrorSlot) {
        let (tx, rx) = mpsc::sync_channel(16);
        let config = Config { io_timeout_ms: timeout_ms, ..cfg() };
        let error = StreamErrorSlot::default();
        (tx, FrameAssembler::new(rx, &config, error.clone()), error)
    }

    #[test]
    fn test_frame_assembler_builds_frames_from_chunks() {
        let (tx, mut frames, _) = assembler(100);
        tx.send(vec![0.5; 3]).unwrap();
        tx.send(vec![0.5; 3]).unwrap();
        let frame = frames.next_frame().unwrap();
        assert_eq!(frame.len(), 4);
        assert!(frame.samples().iter().all(|&s| s == 16_384), "{:?}", frame.samples());
    }

    #[test]
    fn test_frame_assembler_keeps_newest_audio() {
        let (tx, mut frames, _) = assembler(100);
        tx.send(vec![0.1; 4]).unwrap();
        tx.send(vec![0.2; 4]).unwrap();
        tx.send(vec![0.5; 4]).unwrap();
        let frame = frames.next_frame().unwrap();
        assert_eq!(frame.samples(), &[16_384; 4], "stale chunks are discarded");
    }

    #[test]
    fn test_frame_assembler_times_out() {
        let (_tx, mut frames, _) = assembler(20);
        let start = Instant::now();
        assert_eq!(frames.next_frame(), Err(CaptureError::Timeout(20)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_frame_assembler_reports_stream_error() {
        let (tx, mut frames, error) = assembler(100);
        tx.send(vec![0.5; 8]).unwrap();
        error.store("buffer overrun".into());
        assert_eq!(frames.next_frame(), Err(CaptureError::Stream("buffer overrun".into())));
        assert!(frames.next_frame().is_ok(), "the error is reported once");
    }

    #[test]
    fn test_frame_assembler_closed_stream() {
        let (tx, mut frames, _) = assembler(100);
        drop(tx);
        assert!(matches!(frames.next_frame(), Err(CaptureError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_render_queue_blocks_above_high_water_then_times_out() {
        let queue = RenderQueue::new(4, Duration::from_millis(20), StreamErrorSlot::default());
        queue.push(vec![0.25; 8]).unwrap();
        assert_eq!(queue.len(), 8);

        let start = Instant::now();
        assert_eq!(queue.push(vec![0.25; 8]), Err(RenderError::Timeout(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(queue.len(), 8, "a timed-out frame is not queued");

        let mut out = vec![0.0f32; 8];
        queue.fill(&mut out, 1);
        assert_eq!(out, vec![0.25; 8]);
        assert!(queue.push(vec![0.25; 8]).is_ok(), "drained queue accepts frames again");
    }

    #[test]
    fn test_render_queue_reports_stream_error() {
        let error = StreamErrorSlot::default();
        let queue = RenderQueue::new(64, Duration::from_millis(20), error.clone());
        error.store("device unplugged".into());
        assert_eq!(queue.push(vec![0.0; 4]), Err(RenderError::Stream("device unplugged".into())));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_render_queue_fill_and_clear() {
        let queue = RenderQueue::new(64, Duration::from_millis(20), StreamErrorSlot::default());
        queue.push(vec![0.5, -0.5]).unwrap();

        // stereo: each mono sample goes to both channels, then silence
        let mut out = vec![1i16; 6];
        queue.fill(&mut out, 2);
        assert_eq!(out[0], out[1]);
        assert!(out[0] > 16_000 && out[2] < -16_000, "{:?}", out);
        assert_eq!(&out[4..], &[0, 0], "underrun plays silence");

        queue.push(vec![0.1; 10]).unwrap();
        assert_eq!(queue.clear(), 10);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_missing_wav_is_device_unavailable() {
        let result = WavCapture::open("/nonexistent/ambient.wav", &cfg(), false);
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }
}
