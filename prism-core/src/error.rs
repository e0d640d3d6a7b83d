/// User-visible failures of the prediction service. Everything else stays an
/// `anyhow::Error` inside the crate and is flattened into one of these at the
/// adapter boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Loading the pretrained pipeline failed; the handle stays unset so a
    /// later call can retry.
    #[error("could not load the model: {0}")]
    ModelLoad(String),

    /// The inference call failed after a handle existed.
    #[error("image generation failed: {0}")]
    Generation(String),

    /// A request field fell outside the bounds of the UI widget producing it.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
