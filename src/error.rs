/// The closed set of ways a mux operation can fail.
///
/// Every failure in this crate is fatal for the [`crate::Output`] that
/// produced it: there is no internal retry. Callers abandon the `Output` and
/// construct a fresh one rather than trying to resume.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// A public input failed a precondition: wrong metadata shape, unsupported
    /// codec for the chosen format, and so on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A timestamp ordering rule from the front-end validator was violated.
    #[error("timestamp ordering violation on track {track}: {detail}")]
    TimestampOrdering { track: u32, detail: String },

    /// A container-specific hard limit was hit (Matroska cluster length,
    /// unsupported WebM codec, ...).
    #[error("format constraint violated: {0}")]
    FormatConstraint(String),

    /// Metadata required to emit a codec configuration box/element was
    /// missing (AVC/HEVC without `description`, VP8/VP9 without a complete
    /// `VideoColorSpace`, Opus `description` shorter than 18 bytes).
    #[error("descriptor required: {0}")]
    DescriptorRequired(String),

    /// The public API was called out of order: digest before `start`, after
    /// `finalize`, after `close`; double `finalize`; a `Target` or `Source`
    /// reused across `Output`s.
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(String),

    /// An internal invariant was violated — a monotonicity violation on the
    /// `Writer`, or a branch that should be unreachable given the public API
    /// contract.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Propagated I/O failure from an underlying `Target`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MuxError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MuxError::InvalidArgument(msg.into())
    }

    pub fn descriptor_required(msg: impl Into<String>) -> Self {
        MuxError::DescriptorRequired(msg.into())
    }

    pub fn lifecycle_misuse(msg: impl Into<String>) -> Self {
        MuxError::LifecycleMisuse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MuxError::InternalInvariant(msg.into())
    }

    pub fn format_constraint(msg: impl Into<String>) -> Self {
        MuxError::FormatConstraint(msg.into())
    }

    pub fn timestamp_ordering(track: u32, detail: impl Into<String>) -> Self {
        MuxError::TimestampOrdering {
            track,
            detail: detail.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MuxError>;
