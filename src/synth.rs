use decibel::{AmplitudeRatio, DecibelRatio};
use std::f64::consts::TAU;

use crate::organ::Tremulant;
use crate::voice::{RenderJob, VoiceJob};
use crate::wav;

/// Fixed output rate of the playback board.
pub const RENDER_SAMPLE_RATE: u32 = 44100;

/// Applied identically to every voice so full combinations don't clip.
const HEADROOM: f32 = 0.5;

/// Depths substituted for a declared-but-unparameterized tremulant. On/off
/// tremulant stops rarely specify explicit depths.
const DEFAULT_TREM_AM_DEPTH: f32 = 10.0;
const DEFAULT_TREM_PITCH_DEPTH: f32 = 1.0;

/// Pedal voices fade linearly to nothing between these MIDI notes.
const PEDAL_FADE_START: f32 = 36.0;
const PEDAL_FADE_RANGE: f32 = 24.0;

pub fn db_to_linear(db: f32) -> f32 {
    let ratio: AmplitudeRatio<f64> = DecibelRatio(db as f64).into();
    ratio.amplitude_value() as f32
}

/// Cents offset of a footage multiplier relative to 8' unison.
pub fn harmonic_cents(harmonic: f32) -> f32 {
    1200.0 * (harmonic / 8.0).log2()
}

/// Gain scale for pedal voices: full below MIDI 36, silent from 60 up.
pub fn pedal_scale(note: u8) -> f32 {
    (1.0 - (note as f32 - PEDAL_FADE_START) / PEDAL_FADE_RANGE).clamp(0.0, 1.0)
}

fn tremulant_depths(trem: &Tremulant) -> (f32, f32) {
    if trem.am_depth == 0.0 && trem.pitch_depth == 0.0 {
        (DEFAULT_TREM_AM_DEPTH, DEFAULT_TREM_PITCH_DEPTH)
    } else {
        (trem.am_depth, trem.pitch_depth)
    }
}

/// Renders one job to interleaved 16-bit stereo PCM of exactly
/// `job.duration_samples` frames. Returns the buffer and the pre-clip peak.
///
/// Voices that cannot be read are skipped with a warning; a job where every
/// voice fails (or that has none) yields silence, never an error.
pub fn synthesize(job: &RenderJob, global_gain_db: f32, sample_rate: u32) -> (Vec<i16>, f32) {
    let frames = job.duration_samples;
    let mut mix = [vec![0.0f32; frames], vec![0.0f32; frames]];

    // Canonical voice order keeps float summation deterministic across runs.
    let mut voices: Vec<&VoiceJob> = job.voices.iter().collect();
    voices.sort_by(|a, b| a.path.cmp(&b.path).then(a.rendering_note.cmp(&b.rendering_note)));

    let mut mixed = 0usize;
    for voice in &voices {
        if mix_voice(voice, job, global_gain_db, sample_rate, &mut mix) {
            mixed += 1;
        }
    }
    if mixed == 0 && !job.voices.is_empty() {
        log::warn!(
            "[Synth] Track {}: all {} voices failed to load, rendering silence",
            job.track,
            job.voices.len()
        );
    }

    quantize(&mix, frames, job.track)
}

/// Resamples, pitches, loops and modulates one voice into the accumulator.
/// Returns false when the source could not be used.
fn mix_voice(
    voice: &VoiceJob,
    job: &RenderJob,
    global_gain_db: f32,
    sample_rate: u32,
    mix: &mut [Vec<f32>; 2],
) -> bool {
    let (fmt, meta, waves) = match wav::load_sample(&voice.path) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::warn!("[Synth] Skipping voice {:?}: {}", voice.path, e);
            return false;
        }
    };
    if waves.is_empty() || waves[0].is_empty() {
        log::warn!("[Synth] Recording {:?} has no sample data, skipping", voice.path);
        return false;
    }

    let left_src = &waves[0];
    let right_src = waves.get(1).unwrap_or(left_src); // mono plays on both sides
    let src_len = left_src.len();

    let pedal = if voice.is_pedal { pedal_scale(job.note) } else { 1.0 };
    let base_scale =
        voice.volume_scale * db_to_linear(global_gain_db + voice.gain_db) * HEADROOM * pedal;

    // WAV-embedded tuning wins; the ODF pipe tuning field is ignored here.
    let wav_cents = match meta.valid_unity_note() {
        Some(unity) => {
            (voice.rendering_note as f32 - unity as f32) * 100.0
                - (meta.pitch_fraction as f64 / (1u64 << 32) as f64 * 100.0) as f32
        }
        None => 0.0,
    };
    let total_cents = wav_cents + harmonic_cents(voice.harmonic) + voice.extra_cents;
    let pitch_rate = 2f64.powf(total_cents as f64 / 1200.0);
    let playback_rate = pitch_rate * fmt.sample_rate as f64 / sample_rate as f64;

    let loop_region = meta.loop_region().and_then(|(start, end)| {
        let (start, end) = (start as usize, end as usize);
        if start < end && end <= src_len {
            Some((start as f64, end as f64))
        } else {
            log::warn!(
                "[Synth] Invalid loop {}..{} in {:?} ({} frames), playing one-shot",
                start,
                end,
                voice.path,
                src_len
            );
            None
        }
    });

    let tremulants: Vec<(&Tremulant, f32, f32)> = job
        .tremulants
        .iter()
        .filter(|t| t.manual_id.is_none() || t.manual_id == voice.manual_id)
        .map(|t| {
            let (am, pitch) = tremulant_depths(t);
            (t, am, pitch)
        })
        .collect();

    let frames = job.duration_samples;
    let start_frame = (voice.delay_ms as u64 * sample_rate as u64 / 1000) as usize;
    let mut cursor = 0.0f64;

    for i in start_frame..frames {
        let mut scale = base_scale;
        let mut rate = playback_rate;
        if !tremulants.is_empty() {
            let t_ms = i as f64 * 1000.0 / sample_rate as f64;
            for &(trem, am, pitch) in &tremulants {
                let phase = t_ms / trem.period_ms as f64 * TAU;
                let lfo = phase.sin();
                scale *= 1.0 + (am as f64 / 100.0 * lfo) as f32;
                rate *= 1.0 + pitch as f64 / 100.0 * lfo;
            }
        }

        // Fractional-preserving wrap keeps looped recordings phase-continuous.
        // Iterated because one playback step can overshoot a short loop.
        if let Some((loop_start, loop_end)) = loop_region {
            while cursor >= loop_end {
                cursor = loop_start + (cursor - loop_end);
            }
        }

        let i0 = cursor as usize;
        if i0 >= src_len {
            break; // one-shot source exhausted
        }
        let i1 = (i0 + 1).min(src_len - 1);
        let frac = (cursor - i0 as f64) as f32;

        let l = left_src[i0] + (left_src[i1] - left_src[i0]) * frac;
        let r = right_src[i0] + (right_src[i1] - right_src[i0]) * frac;
        mix[0][i] += l * scale;
        mix[1][i] += r * scale;

        cursor += rate;
    }

    true
}

/// Clamps and converts the stereo accumulator to interleaved i16, tracking
/// the pre-clip peak for diagnostics.
fn quantize(mix: &[Vec<f32>; 2], frames: usize, track: u32) -> (Vec<i16>, f32) {
    let mut peak = 0.0f32;
    let mut pcm = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        for sample in [mix[0][i], mix[1][i]] {
            peak = peak.max(sample.abs());
            pcm.push((sample.clamp(-1.0, 1.0) * 32767.0).round() as i16);
        }
    }
    if peak > 1.0 {
        log::warn!("[Synth] Track {} clipped: peak {:.3}", track, peak);
    } else {
        log::debug!("[Synth] Track {} peak {:.3}", track, peak);
    }
    (pcm, peak)
}
