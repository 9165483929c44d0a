//! Offline renderer turning a sampled organ definition into fixed-rate WAV
//! tracks for an embedded playback board. One render request covers one bank:
//! every note of the 61-key keyboard is mixed from the active stops' pipe
//! recordings and written as `{track:04}.wav` at 44.1 kHz stereo, with a
//! `tco.txt` index mapping bank numbers to names.

pub mod organ;
pub mod render;
pub mod synth;
pub mod voice;
pub mod wav;

pub use organ::{OrganData, RenderRequest};
pub use render::{
    render_bank, render_bank_to_memory, RenderOutcome, RenderSession, DEFAULT_WORKER_COUNT,
};
pub use voice::StretchStrategy;
