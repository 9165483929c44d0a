use itertools::Itertools;
use serde::Deserialize;
use std::path::PathBuf;

use crate::organ::{OrganData, Pipe, Rank, Stop, Tremulant};

/// Stop ids carrying this prefix name a tremulant rather than a speaking stop.
const TREMULANT_ID_PREFIX: &str = "trem";

/// Pipes considered by the `highest_notes` strategy.
const HIGHEST_NOTES_POOL: usize = 3;

/// How a missing pipe recording is substituted when a rank covers fewer
/// notes than the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StretchStrategy {
    /// Exact recordings only; anything else stays silent.
    None,
    /// Step down an octave at a time and pitch the recording back up.
    Octave,
    /// Substitute the highest recorded pipe for notes above the rank's top.
    HighestNote,
    /// Cycle among the top recorded pipes so adjacent stretched notes don't
    /// reuse the identical sample.
    HighestNotes,
}

/// One voice to mix into a note's render: a (note, stop, pipe) match with
/// all gain and pitch terms resolved.
#[derive(Debug, Clone)]
pub struct VoiceJob {
    pub path: PathBuf,
    pub release_path: Option<PathBuf>,
    /// Stop volume as a 0-1 scalar.
    pub volume_scale: f32,
    /// manual + stop + rank + pipe gains, summed in dB.
    pub gain_db: f32,
    /// Pitch compensation introduced by stretching plus the stop's own shift.
    pub extra_cents: f32,
    /// Effective footage multiplier (pipe harmonic x stop multiplier).
    pub harmonic: f32,
    /// The MIDI note the source recording was made at. Never the adjusted
    /// note: the synthesis step must not re-apply the stretch shift.
    pub rendering_note: u8,
    pub is_pedal: bool,
    pub delay_ms: u32,
    pub manual_id: Option<String>,
}

/// One unit of work for the render pool: everything needed to produce a
/// single output track.
#[derive(Debug, Clone)]
pub struct RenderJob {
    /// The requested keyboard note.
    pub note: u8,
    /// note + bank * 128.
    pub track: u32,
    pub voices: Vec<VoiceJob>,
    pub tremulants: Vec<Tremulant>,
    pub duration_samples: usize,
}

/// Resolves one requested note of one active stop into concrete voices,
/// one per rank that can satisfy it. A stop with no matching pipe in any
/// rank contributes zero voices; that is silence, not an error.
pub fn resolve_note(
    stop: &Stop,
    note: u8,
    organ: &OrganData,
    strategy: StretchStrategy,
) -> Vec<VoiceJob> {
    let mut voices = Vec::new();

    let manual = organ.manual_for(stop);
    let manual_gain_db = manual.map_or(0.0, |m| m.gain_db);
    let is_pedal = manual.is_some_and(|m| m.is_pedal());

    let adjusted = note as i32 + stop.note_offset;
    if !(0..=127).contains(&adjusted) {
        log::debug!(
            "[Resolver] Stop '{}' offset pushes note {} to {} (outside MIDI range)",
            stop.name,
            note,
            adjusted
        );
        return voices;
    }
    let adjusted = adjusted as u8;

    for rank_id in &stop.rank_ids {
        let Some(rank) = organ.ranks.get(rank_id) else {
            log::warn!("[Resolver] Stop '{}' references unknown rank '{}'", stop.name, rank_id);
            continue;
        };

        let Some((pipe, stretch_cents)) = find_pipe(rank, adjusted, strategy) else {
            log::debug!(
                "[Resolver] No pipe for note {} in rank '{}' (strategy {:?})",
                adjusted,
                rank.name,
                strategy
            );
            continue;
        };

        voices.push(VoiceJob {
            path: pipe.path.clone(),
            release_path: pipe.release_path.clone(),
            volume_scale: stop.volume / 100.0,
            gain_db: manual_gain_db + stop.gain_db + rank.gain_db + pipe.gain_db,
            extra_cents: stretch_cents + stop.pitch_shift_cents,
            harmonic: pipe.harmonic * stop.harmonic_multiplier,
            rendering_note: pipe.midi_note,
            is_pedal,
            delay_ms: rank.tracker_delay_ms,
            manual_id: stop.manual_id.clone(),
        });
    }

    voices
}

/// Finds the pipe satisfying `adjusted` in one rank, together with the
/// compensating pitch shift in cents.
fn find_pipe(rank: &Rank, adjusted: u8, strategy: StretchStrategy) -> Option<(&Pipe, f32)> {
    if let Some(pipe) = rank.pipe_at(adjusted) {
        return Some((pipe, 0.0));
    }

    match strategy {
        StretchStrategy::None => None,
        StretchStrategy::Octave => {
            // Search downward an octave at a time; k octaves down means the
            // recording is pitched up by 1200 * k cents. Notes below the
            // lowest recorded pipe stay unresolved by design.
            let mut k = 1i32;
            loop {
                let candidate = adjusted as i32 - 12 * k;
                if candidate < 0 {
                    return None;
                }
                if let Some(pipe) = rank.pipe_at(candidate as u8) {
                    return Some((pipe, 1200.0 * k as f32));
                }
                k += 1;
            }
        }
        StretchStrategy::HighestNote => {
            let highest = rank.pipes.iter().max_by_key(|p| p.midi_note)?;
            if adjusted > highest.midi_note {
                Some((highest, (adjusted as f32 - highest.midi_note as f32) * 100.0))
            } else {
                None
            }
        }
        StretchStrategy::HighestNotes => {
            let highest = rank.pipes.iter().map(|p| p.midi_note).max()?;
            if adjusted <= highest {
                return None;
            }
            // Top pipes in ascending note order; cycling by the requested
            // note spreads adjacent stretched notes across the pool.
            let pool: Vec<&Pipe> = rank
                .pipes
                .iter()
                .sorted_by_key(|p| std::cmp::Reverse(p.midi_note))
                .take(HIGHEST_NOTES_POOL)
                .sorted_by_key(|p| p.midi_note)
                .collect();
            let pipe = pool[adjusted as usize % pool.len()];
            Some((pipe, (adjusted as f32 - pipe.midi_note as f32) * 100.0))
        }
    }
}

/// Maps tremulant entries in the combination to their Tremulant records.
/// Entries with the tremulant prefix that name nothing are skipped.
pub fn active_tremulants(combination: &[String], organ: &OrganData) -> Vec<Tremulant> {
    combination
        .iter()
        .filter(|id| id.to_lowercase().starts_with(TREMULANT_ID_PREFIX))
        .filter_map(|id| {
            let trem = organ.tremulants.get(id);
            if trem.is_none() {
                log::warn!("[Resolver] Combination names unknown tremulant '{}'", id);
            }
            trem.cloned()
        })
        .collect()
}

/// True when a combination entry should be treated as a tremulant id.
pub fn is_tremulant_id(id: &str) -> bool {
    id.to_lowercase().starts_with(TREMULANT_ID_PREFIX)
}
