//! Error types for the visual front end

/// Result type alias
pub type Result<T> = std::result::Result<T, FrontendError>;

/// Hard failures of a tracking tick.
///
/// Anything recoverable (lost tracking, too few tracks, a missing encoder
/// reading) is reported through [`crate::slam::tracker::TrackingEvent`] instead.
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// A frame arrived older than the previously accepted one.
    /// The front end refuses every further frame until it is reset.
    #[error("got image older than previous image: {current} < {previous}")]
    TimeRegression {
        /// Timestamp of the last accepted frame (seconds)
        previous: f64,
        /// Timestamp of the offending frame (seconds)
        current: f64,
    },

    /// A frame carried a NaN or infinite timestamp
    #[error("timestamp {0} is not a finite number of seconds")]
    InvalidTimestamp(f64),

    /// Invalid or unreadable parameters
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Image dimensions differ from the calibrated camera
    #[error("image is {actual:?}, camera is calibrated for {expected:?}")]
    ImageSizeMismatch {
        /// Calibrated (width, height)
        expected: (u32, u32),
        /// Received (width, height)
        actual: (u32, u32),
    },

    /// Stereo front end was handed a single image
    #[error("stereo input requires a right image")]
    MissingRightImage,
}

/// Parameter loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the parameter file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML did not deserialize
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A parameter is out of its valid range
    #[error("invalid parameter: {0}")]
    Invalid(String),
}
