//! Tone and clip playback through one PCM sink shared by every speaker.
//!
//! Each speaker is an amplifier with its own shutdown (mute) line on one
//! side of the stereo output. Playing on a subset of speakers mutes the
//! rest before the clip is submitted.
use indexmap::IndexMap;
use parking_lot::Mutex;
use reward_hardware::util::BOTH_CHANNELS;
use reward_traits::{AudioOutput, DigitalOutput};
use serde::Serialize;

use crate::error::{Result, RewardError};
use crate::hw_error::hw;

/// Longest clip the mixer renders.
pub const MAX_CLIP_SECS: f64 = 600.0;

pub struct Speaker {
    sd: Mutex<Box<dyn DigitalOutput>>,
    channel: u8,
}

impl Speaker {
    /// The amplifier starts muted.
    pub fn new(mut sd: Box<dyn DigitalOutput>, channel: u8) -> Result<Self> {
        sd.set_level(false).map_err(hw)?;
        Ok(Self {
            sd: Mutex::new(sd),
            channel,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn is_enabled(&self) -> bool {
        self.sd.lock().level()
    }

    fn set_enabled(&self, on: bool) -> Result<()> {
        self.sd.lock().set_level(on).map_err(hw)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioStatus {
    pub fs: u32,
    pub busy: bool,
    pub speakers: IndexMap<String, bool>,
}

pub struct AudioMixer {
    fs: u32,
    output: Mutex<Box<dyn AudioOutput>>,
    speakers: IndexMap<String, Speaker>,
}

impl AudioMixer {
    pub fn new(fs: u32, output: Box<dyn AudioOutput>, speakers: IndexMap<String, Speaker>) -> Self {
        Self {
            fs,
            output: Mutex::new(output),
            speakers,
        }
    }

    pub fn fs(&self) -> u32 {
        self.fs
    }

    pub fn is_busy(&self) -> bool {
        self.output.lock().is_busy()
    }

    pub fn has_speaker(&self, name: &str) -> bool {
        self.speakers.contains_key(name)
    }

    pub fn status(&self) -> AudioStatus {
        AudioStatus {
            fs: self.fs,
            busy: self.is_busy(),
            speakers: self
                .speakers
                .iter()
                .map(|(n, s)| (n.clone(), s.is_enabled()))
                .collect(),
        }
    }

    /// Play a sine tone on `targets` (every speaker when empty).
    pub fn play_tone(
        &self,
        targets: &[String],
        freq: f64,
        dur: f64,
        volume: f64,
        force: bool,
    ) -> Result<()> {
        let nyquist = f64::from(self.fs) / 2.0;
        if !(freq.is_finite() && freq > 0.0 && freq < nyquist) {
            return Err(RewardError::InvalidArgument(format!(
                "freq must be in (0, {nyquist}) Hz, got {freq}"
            )));
        }
        if !(dur.is_finite() && dur > 0.0 && dur <= MAX_CLIP_SECS) {
            return Err(RewardError::InvalidArgument(format!(
                "dur must be in (0, {MAX_CLIP_SECS}] s, got {dur}"
            )));
        }
        if !(0.0..=1.0).contains(&volume) {
            return Err(RewardError::InvalidArgument(format!(
                "volume must be in [0, 1], got {volume}"
            )));
        }
        let samples = render_tone(self.fs, freq, dur, volume);
        self.submit(targets, &samples, force)
    }

    /// Play arbitrary mono samples in [-1, 1]; `fs` defaults to the mixer
    /// rate and other rates are linearly resampled.
    pub fn play(&self, targets: &[String], signal: &[f32], fs: Option<u32>, force: bool) -> Result<()> {
        if signal.is_empty() {
            return Err(RewardError::InvalidArgument("signal is empty".into()));
        }
        let src_fs = fs.unwrap_or(self.fs);
        if src_fs == 0 {
            return Err(RewardError::InvalidArgument("fs must be > 0".into()));
        }
        let out_len = signal.len() as f64 * f64::from(self.fs) / f64::from(src_fs);
        if out_len > MAX_CLIP_SECS * f64::from(self.fs) {
            return Err(RewardError::InvalidArgument(format!(
                "signal lasts {:.1} s, longer than {MAX_CLIP_SECS} s",
                out_len / f64::from(self.fs)
            )));
        }
        let resampled;
        let signal = if src_fs == self.fs {
            signal
        } else {
            resampled = resample_linear(signal, src_fs, self.fs);
            &resampled[..]
        };
        let samples: Vec<i16> = signal.iter().map(|&x| to_pcm(f64::from(x))).collect();
        self.submit(targets, &samples, force)
    }

    pub fn stop(&self) -> Result<()> {
        self.output.lock().stop().map_err(hw)?;
        self.mute_all()
    }

    fn submit(&self, targets: &[String], samples: &[i16], force: bool) -> Result<()> {
        let chosen: Vec<&Speaker> = if targets.is_empty() {
            self.speakers.values().collect()
        } else {
            targets
                .iter()
                .map(|t| {
                    self.speakers
                        .get(t)
                        .ok_or_else(|| RewardError::MissingResource(format!("speaker '{t}'")))
                })
                .collect::<Result<_>>()?
        };
        if chosen.is_empty() {
            return Err(RewardError::MissingResource("no speakers configured".into()));
        }

        let mut out = self.output.lock();
        if out.is_busy() {
            if !force {
                return Err(RewardError::ResourceLocked("audio stream".into()));
            }
            out.stop().map_err(hw)?;
        }
        self.mute_all()?;
        for s in &chosen {
            s.set_enabled(true)?;
        }
        let first = chosen[0].channel;
        let channel = if chosen.iter().all(|s| s.channel == first) {
            first
        } else {
            BOTH_CHANNELS
        };
        out.play(channel, samples, self.fs).map_err(hw)?;
        tracing::debug!(samples = samples.len(), channel, "clip submitted");
        Ok(())
    }

    fn mute_all(&self) -> Result<()> {
        for s in self.speakers.values() {
            s.set_enabled(false)?;
        }
        Ok(())
    }
}

fn to_pcm(x: f64) -> i16 {
    (x.clamp(-1.0, 1.0) * f64::from(i16::MAX)).round() as i16
}

/// Mono 16-bit sine of `round(fs * dur)` samples.
pub fn render_tone(fs: u32, freq: f64, dur: f64, volume: f64) -> Vec<i16> {
    let n = (f64::from(fs) * dur).round() as usize;
    let w = std::f64::consts::TAU * freq / f64::from(fs);
    (0..n).map(|i| to_pcm(volume * (w * i as f64).sin())).collect()
}

/// Linear interpolation from `from` Hz to `to` Hz.
pub fn resample_linear(signal: &[f32], from: u32, to: u32) -> Vec<f32> {
    if signal.len() < 2 || from == to {
        return signal.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let n = ((signal.len() as f64) / ratio).round().max(1.0) as usize;
    let last = signal.len() - 1;
    (0..n)
        .map(|i| {
            let pos = i as f64 * ratio;
            let k = (pos.floor() as usize).min(last);
            let frac = (pos - k as f64) as f32;
            let a = signal[k];
            let b = signal[(k + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_length_and_peak() {
        let s = render_tone(44_100, 1_000.0, 0.1, 0.5);
        assert_eq!(s.len(), 4_410);
        let peak = s.iter().map(|v| v.unsigned_abs()).max().unwrap();
        assert!((i32::from(peak) - i32::from(i16::MAX) / 2).abs() < 200);
    }

    #[test]
    fn resample_halves_length() {
        let sig: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&sig, 2_000, 1_000);
        assert_eq!(out.len(), 50);
        assert_eq!(out[10], 20.0);
    }
}
