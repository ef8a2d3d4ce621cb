use std::sync::Arc;

use crate::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum OutputConfigError {
    #[error("Output \"{0}\" is active. Encoders cannot be changed while active.")]
    OutputActive(OutputId),

    #[error("Encoder \"{encoder}\" produces {actual:?} but a {expected:?} encoder is required.")]
    EncoderKindMismatch {
        encoder: Arc<str>,
        expected: MediaKind,
        actual: MediaKind,
    },

    #[error("Audio track index {0} is out of range (outputs carry at most {MAX_AUDIO_MIXES} tracks).")]
    TrackOutOfRange(usize),

    #[error("Output \"{0}\" is not a multi-track output; only track 0 may be assigned.")]
    NotMultiTrack(OutputId),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("Caption data must be pushed as whole 3-byte cc_data tuples, got {0} bytes.")]
    UnalignedData(usize),
}
