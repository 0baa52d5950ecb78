//! Audio capture and encoding (spec §6): `cpal` loopback capture resampled
//! to the PCMU wire format — 8 kHz, mono, 20 ms / 160-sample frames,
//! G.711 μ-law encoded. Device selection and the dedicated capture-thread
//! shape follow the teacher's loopback-capture loop; the codec is
//! hand-rolled since G.711 has no meaningful "library" in this ecosystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// PCMU clock rate (spec §6: "Audio: PCMU, 8 kHz, mono").
const PCMU_SAMPLE_RATE: u32 = 8_000;
/// Frame duration in milliseconds (spec §6: "20 ms frames").
const PCMU_FRAME_MS: usize = 20;
/// Samples (and output bytes, one byte per μ-law sample) per frame.
const PCMU_FRAME_SAMPLES: usize = (PCMU_SAMPLE_RATE as usize * PCMU_FRAME_MS) / 1000;

/// Manages audio capture sessions, one per desktop session.
pub struct AudioCapturer {
    sessions: HashMap<String, AudioSession>,
}

struct AudioSession {
    stop_flag: Arc<AtomicBool>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl Default for AudioCapturer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCapturer {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Starts capturing audio for a session. PCMU frames (160 bytes each)
    /// are pushed to `tx` as they're encoded.
    pub fn start_capture(&mut self, session_id: &str, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.stop_capture(session_id);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let sid = session_id.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("audio-capture-{}", &sid[..8.min(sid.len())]))
            .spawn(move || {
                if let Err(e) = run_capture_loop(&sid, stop_clone, tx) {
                    tracing::warn!(session_id=%sid, "audio capture ended with error: {e}");
                } else {
                    tracing::info!(session_id=%sid, "audio capture ended cleanly");
                }
            })
            .expect("failed to spawn audio capture thread");

        self.sessions.insert(
            session_id.to_string(),
            AudioSession {
                stop_flag,
                thread_handle: Some(thread),
            },
        );

        tracing::info!(session_id=%session_id, "audio capture started");
    }

    pub fn stop_capture(&mut self, session_id: &str) {
        if let Some(mut session) = self.sessions.remove(session_id) {
            session.stop_flag.store(true, Ordering::Relaxed);
            if let Some(handle) = session.thread_handle.take() {
                let _ = handle.join();
            }
            tracing::info!(session_id=%session_id, "audio capture stopped");
        }
    }

    pub fn stop_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.stop_capture(&id);
        }
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Core capture loop running on a dedicated thread: pulls PCM from the
/// loopback device, resamples to 8 kHz mono, and μ-law encodes in
/// 160-sample frames.
fn run_capture_loop(
    session_id: &str,
    stop_flag: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error>> {
    use cpal::traits::{DeviceTrait, StreamTrait};

    let host = cpal::default_host();
    let device = get_capture_device(&host)?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(session_id=%session_id, device=%device_name, "using audio capture device");

    let supported_config = device.default_input_config()?;
    let sample_rate = supported_config.sample_rate().0;
    let channels = supported_config.channels() as u32;
    let sample_format = supported_config.sample_format();

    tracing::info!(
        session_id=%session_id,
        sample_rate=%sample_rate,
        channels=%channels,
        sample_format=?sample_format,
        "audio device config"
    );

    let pcm_buf: Arc<std::sync::Mutex<Vec<f32>>> = Arc::new(std::sync::Mutex::new(Vec::with_capacity(PCMU_FRAME_SAMPLES * 8)));
    let pcm_buf_writer = pcm_buf.clone();
    let stop_for_stream = stop_flag.clone();
    let src_rate = sample_rate;
    let src_channels = channels;

    let config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if stop_for_stream.load(Ordering::Relaxed) {
                    return;
                }
                let resampled = resample_to_mono_8k(data, src_rate, src_channels);
                if let Ok(mut buf) = pcm_buf_writer.lock() {
                    buf.extend_from_slice(&resampled);
                }
            },
            |err| tracing::warn!("audio stream error: {err}"),
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if stop_for_stream.load(Ordering::Relaxed) {
                    return;
                }
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let resampled = resample_to_mono_8k(&floats, src_rate, src_channels);
                if let Ok(mut buf) = pcm_buf_writer.lock() {
                    buf.extend_from_slice(&resampled);
                }
            },
            |err| tracing::warn!("audio stream error: {err}"),
            None,
        )?,
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                if stop_for_stream.load(Ordering::Relaxed) {
                    return;
                }
                let floats: Vec<f32> = data.iter().map(|&s| (s as f32 / 32768.0) - 1.0).collect();
                let resampled = resample_to_mono_8k(&floats, src_rate, src_channels);
                if let Ok(mut buf) = pcm_buf_writer.lock() {
                    buf.extend_from_slice(&resampled);
                }
            },
            |err| tracing::warn!("audio stream error: {err}"),
            None,
        )?,
        fmt => return Err(format!("unsupported sample format: {fmt:?}").into()),
    };

    stream.play()?;
    tracing::info!(session_id=%session_id, "audio stream playing");

    while !stop_flag.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut samples_to_encode = Vec::new();
        if let Ok(mut buf) = pcm_buf.lock() {
            if buf.len() >= PCMU_FRAME_SAMPLES {
                let drain_len = buf.len() - (buf.len() % PCMU_FRAME_SAMPLES);
                samples_to_encode = buf.drain(..drain_len).collect();
            }
        }

        for chunk in samples_to_encode.chunks_exact(PCMU_FRAME_SAMPLES) {
            let frame = encode_pcmu_frame(chunk);
            if tx.send(frame).is_err() {
                tracing::debug!("audio tx channel closed");
                return Ok(());
            }
        }
    }

    drop(stream);
    tracing::info!(session_id=%session_id, "audio capture loop exiting");
    Ok(())
}

fn encode_pcmu_frame(samples: &[f32]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_ulaw((s * 32767.0) as i16)).collect()
}

/// G.711 μ-law encoding (ITU-T G.711): 14-bit linear input, 8-segment
/// logarithmic companding to an 8-bit sample.
const ULAW_SEGMENT_ENDS: [i32; 8] = [0xff, 0x1ff, 0x3ff, 0x7ff, 0xfff, 0x1fff, 0x3fff, 0x7fff];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

fn linear_to_ulaw(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80u8 } else { 0x00u8 };
    let mut magnitude = if sample < 0 { -(sample as i32) } else { sample as i32 };
    if magnitude > ULAW_CLIP {
        magnitude = ULAW_CLIP;
    }
    magnitude += ULAW_BIAS;

    let exponent = ULAW_SEGMENT_ENDS
        .iter()
        .position(|&end| magnitude <= end)
        .unwrap_or(7) as u8;
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0f) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Picks the best available loopback/monitor device for system audio.
#[allow(unreachable_code)]
fn get_capture_device(host: &cpal::Host) -> Result<cpal::Device, Box<dyn std::error::Error>> {
    use cpal::traits::{DeviceTrait, HostTrait};

    #[cfg(target_os = "linux")]
    {
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    if name.contains(".monitor") || name.contains("Monitor") {
                        tracing::info!("found audio monitor device: {name}");
                        return Ok(device);
                    }
                }
            }
        }
        // Refuses to fall back to the default input (typically a
        // microphone, which would light the webcam/mic indicator).
        tracing::warn!("no audio monitor/loopback device found — audio capture disabled");
        return Err("no audio monitor device found (refusing to use microphone)".into());
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(device) = host.default_output_device() {
            tracing::info!("using default output device for WASAPI loopback");
            return Ok(device);
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        return host.default_input_device().ok_or_else(|| "no audio input device available".into());
    }

    #[cfg(any(target_os = "linux", target_os = "windows"))]
    Err("no suitable audio capture device found".into())
}

/// Resamples interleaved PCM from an arbitrary rate/channel count down to
/// 8 kHz mono via linear interpolation and channel averaging.
fn resample_to_mono_8k(samples: &[f32], src_rate: u32, src_channels: u32) -> Vec<f32> {
    if src_channels == 0 || samples.is_empty() {
        return Vec::new();
    }

    let src_frames = samples.len() / src_channels as usize;
    if src_frames == 0 {
        return Vec::new();
    }

    let mono: Vec<f32> = (0..src_frames)
        .map(|i| {
            let base = i * src_channels as usize;
            let sum: f32 = samples[base..base + src_channels as usize].iter().sum();
            sum / src_channels as f32
        })
        .collect();

    if src_rate == PCMU_SAMPLE_RATE {
        return mono;
    }

    let dst_frames = (src_frames as u64 * PCMU_SAMPLE_RATE as u64 / src_rate as u64) as usize;
    let mut output = Vec::with_capacity(dst_frames);
    for i in 0..dst_frames {
        let src_pos = i as f64 * src_rate as f64 / PCMU_SAMPLE_RATE as f64;
        let src_idx = src_pos as usize;
        let frac = (src_pos - src_idx as f64) as f32;
        let s0 = mono.get(src_idx).copied().unwrap_or(0.0);
        let s1 = mono.get(src_idx + 1).copied().unwrap_or(s0);
        output.push(s0 + (s1 - s0) * frac);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_zero_sample_roundtrips_near_zero() {
        let encoded = linear_to_ulaw(0);
        // 0xFF/0x7F are the canonical μ-law codes for signed zero.
        assert!(encoded == 0xff || encoded == 0x7f);
    }

    #[test]
    fn ulaw_clips_large_magnitude_without_panicking() {
        let _ = linear_to_ulaw(i16::MAX);
        let _ = linear_to_ulaw(i16::MIN);
    }

    #[test]
    fn pcmu_frame_is_160_bytes_for_160_samples() {
        let samples = vec![0.0f32; PCMU_FRAME_SAMPLES];
        let frame = encode_pcmu_frame(&samples);
        assert_eq!(frame.len(), 160);
    }

    #[test]
    fn resample_mono_passthrough_at_matching_rate() {
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        let out = resample_to_mono_8k(&samples, PCMU_SAMPLE_RATE, 1);
        assert_eq!(out, samples);
    }

    #[test]
    fn resample_downmixes_stereo_to_mono() {
        // L=1.0, R=-1.0 should average to ~0.
        let samples = vec![1.0, -1.0, 1.0, -1.0];
        let out = resample_to_mono_8k(&samples, PCMU_SAMPLE_RATE, 2);
        assert!(out.iter().all(|&v| v.abs() < 1e-6));
    }
}
