//! Error kinds surfaced by the upscale pipeline.

use thiserror::Error;

/// Failures of a tiled upscale run.
///
/// All variants are terminal for the current job: nothing is retried
/// automatically, and there is no partial-success value. Tiles already
/// written to the destination before a failure remain in place.
///
/// `Clone` is required so that a session-creation failure can be observed
/// by every caller awaiting the same memoized creation future; causes are
/// therefore carried as formatted strings rather than source chains.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpscaleError {
    /// The inference engine could not be initialized. The job was never
    /// started and a later attempt may retry creation fresh.
    #[error("failed to create inference session: {cause}")]
    SessionCreationFailed { cause: String },

    /// One tile's inference call failed; the whole job aborts.
    #[error("inference failed on tile ({x}, {y}): {cause}")]
    InferenceFailed { x: u32, y: u32, cause: String },

    /// A 4-dimensional model output had neither a channel-first nor a
    /// channel-last signature.
    #[error("unknown tensor layout: {dims:?}")]
    UnsupportedLayout { dims: Vec<usize> },

    /// The model output was not 4-dimensional.
    #[error("unexpected tensor dims: {dims:?}")]
    UnexpectedTensorShape { dims: Vec<usize> },

    /// An upscale was requested before any source image was supplied.
    #[error("no source image has been supplied")]
    NoSourceImage,
}

impl UpscaleError {
    /// True for the decode-side failures that mean the model's output
    /// format could not be interpreted.
    pub fn is_layout_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLayout { .. } | Self::UnexpectedTensorShape { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, UpscaleError>;
