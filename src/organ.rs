use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::voice::StretchStrategy;

/// Lowest MIDI note of the 61-note keyboard the playback board drives.
pub const FIRST_KEYBOARD_NOTE: u8 = 36;
pub const KEYBOARD_NOTE_COUNT: u8 = 61;
/// Track numbering doubles the note space per bank: track = note + bank * 128.
pub const TRACKS_PER_BANK: u32 = 128;
/// Render length used when the request carries no per-note durations.
pub const DEFAULT_NOTE_DURATION_SECS: u32 = 10;

fn default_volume() -> f32 {
    100.0
}
fn default_harmonic() -> f32 {
    8.0
}
fn default_multiplier() -> f32 {
    1.0
}

/// Top-level structure for the entire organ definition, built by the
/// out-of-scope ODF parser and handed over as JSON. Read-only for the
/// duration of one render.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganData {
    /// Global output gain applied to every voice.
    #[serde(default)]
    pub gain_db: f32,
    #[serde(default)]
    pub stops: HashMap<String, Stop>,
    #[serde(default)]
    pub ranks: HashMap<String, Rank>,
    #[serde(default)]
    pub manuals: HashMap<String, Manual>,
    #[serde(default)]
    pub tremulants: HashMap<String, Tremulant>,
}

impl OrganData {
    /// The manual a stop sits on, if it names one that exists.
    pub fn manual_for(&self, stop: &Stop) -> Option<&Manual> {
        stop.manual_id.as_ref().and_then(|id| self.manuals.get(id))
    }
}

/// A user-selectable voice, activating one or more ranks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rank_ids: Vec<String>,
    #[serde(default)]
    pub manual_id: Option<String>,
    /// Linear percentage, 0-100.
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub gain_db: f32,
    /// Semitone offset applied to the requested note before pipe lookup.
    #[serde(default)]
    pub note_offset: i32,
    /// Extra detune for virtual derived stops.
    #[serde(default)]
    pub pitch_shift_cents: f32,
    /// Footage multiplier for virtual derived stops (1 = as recorded).
    #[serde(default = "default_multiplier")]
    pub harmonic_multiplier: f32,
}

/// A set of pipe recordings of one timbre across the keyboard range.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rank {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gain_db: f32,
    /// Mechanical action delay carried into each voice's start offset.
    #[serde(default)]
    pub tracker_delay_ms: u32,
    #[serde(default)]
    pub pipes: Vec<Pipe>,
}

impl Rank {
    pub fn pipe_at(&self, midi_note: u8) -> Option<&Pipe> {
        self.pipes.iter().find(|p| p.midi_note == midi_note)
    }
}

/// One recorded sample at one MIDI note within a rank.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipe {
    pub midi_note: u8,
    pub path: PathBuf,
    #[serde(default)]
    pub release_path: Option<PathBuf>,
    #[serde(default)]
    pub gain_db: f32,
    /// Footage-relative multiplier; 8 = unison.
    #[serde(default = "default_harmonic")]
    pub harmonic: f32,
    /// ODF-declared tuning. Parsed and carried but never applied: the engine
    /// tunes from the WAV-embedded unity note instead.
    #[serde(default)]
    pub tuning_cents: f32,
}

/// A keyboard division, including the pedalboard.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manual {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gain_db: f32,
}

impl Manual {
    pub fn is_pedal(&self) -> bool {
        self.name.to_lowercase().contains("pedal")
    }
}

/// A periodic amplitude/pitch modulation effect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tremulant {
    #[serde(default)]
    pub id: String,
    /// Modulation period in milliseconds.
    pub period_ms: f32,
    /// Amplitude modulation depth, percent.
    #[serde(default)]
    pub am_depth: f32,
    /// Pitch modulation depth, percent.
    #[serde(default)]
    pub pitch_depth: f32,
    /// When set, the tremulant only affects voices on this manual.
    #[serde(default)]
    pub manual_id: Option<String>,
}

/// One bank render request as delivered by the UI/IPC layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub bank_number: u32,
    #[serde(default)]
    pub bank_name: String,
    pub combination: Vec<String>,
    pub organ_data: OrganData,
    pub output_dir: PathBuf,
    pub stretch_strategy: StretchStrategy,
    /// Seconds per keyboard note starting at MIDI 36; the last entry repeats
    /// when the list is shorter than the keyboard.
    #[serde(default)]
    pub note_durations: Option<Vec<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_from_ui_json() {
        let json = r#"{
            "bankNumber": 3,
            "bankName": "Pleno",
            "combination": ["stop-001", "trem-1"],
            "organData": {
                "gainDb": -3.0,
                "stops": {
                    "stop-001": {
                        "name": "Principal 8",
                        "rankIds": ["r1"],
                        "manualId": "m1",
                        "volume": 80,
                        "noteOffset": 12
                    }
                },
                "ranks": {
                    "r1": {
                        "name": "Principal",
                        "gainDb": 1.5,
                        "pipes": [
                            { "midiNote": 60, "path": "r1/060.wav", "harmonic": 8, "tuningCents": -4.2 }
                        ]
                    }
                },
                "manuals": {
                    "m1": { "name": "Great", "gainDb": 0.0 }
                },
                "tremulants": {
                    "trem-1": { "periodMs": 200, "amDepth": 12, "manualId": "m1" }
                }
            },
            "outputDir": "/tmp/out",
            "stretchStrategy": "octave"
        }"#;

        let request: RenderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.bank_number, 3);
        assert_eq!(request.combination.len(), 2);
        assert_eq!(request.stretch_strategy, StretchStrategy::Octave);
        assert!(request.note_durations.is_none());

        let stop = &request.organ_data.stops["stop-001"];
        assert_eq!(stop.volume, 80.0);
        assert_eq!(stop.note_offset, 12);
        assert_eq!(stop.harmonic_multiplier, 1.0); // default

        let rank = &request.organ_data.ranks["r1"];
        assert_eq!(rank.pipes[0].midi_note, 60);
        assert_eq!(rank.pipes[0].tuning_cents, -4.2);
        assert!(rank.pipes[0].release_path.is_none());

        let trem = &request.organ_data.tremulants["trem-1"];
        assert_eq!(trem.pitch_depth, 0.0);
        assert_eq!(trem.manual_id.as_deref(), Some("m1"));
    }

    #[test]
    fn pedal_manual_is_inferred_from_name() {
        let pedal = Manual { id: "p".into(), name: "Pedalboard".into(), gain_db: 0.0 };
        let great = Manual { id: "g".into(), name: "Great".into(), gain_db: 0.0 };
        assert!(pedal.is_pedal());
        assert!(!great.is_pedal());
    }
}
