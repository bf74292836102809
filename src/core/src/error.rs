use thiserror::Error;

/// imagekit error types.
///
/// Message shapes for the image-level variants are part of the public
/// contract: callers match on them to distinguish a missing image from a
/// missing layer or an unreachable previous image.
#[derive(Error, Debug)]
pub enum ImageError {
    /// A read operation was issued against an image that does not exist.
    #[error("failed to get {field}, image '{name}' does not exist")]
    ImageNotFound { field: &'static str, name: String },

    /// ReuseLayer could not find the requested diff id in the previous image.
    #[error("previous image did not have layer with sha '{0}'")]
    PreviousLayerNotFound(String),

    /// The previous image reference does not resolve.
    #[error("failed to get layers for previous image with repo name '{0}'")]
    PreviousImageNotFound(String),

    /// GetLayer could not find the requested diff id in the image.
    #[error("image '{name}' does not have layer with diff id '{diff_id}'")]
    LayerNotFound { name: String, diff_id: String },

    /// Rebase was given an old top layer that is not in the current stack.
    #[error("old top layer with diff id '{0}' not found in image")]
    BadOldTopLayer(String),

    /// TopLayer was queried on an image with an empty layer stack.
    #[error("image '{0}' has no layers")]
    EmptyLayerStack(String),

    /// Image reference parsing failed.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Registry or token-service authentication failure (401/403).
    #[error("registry authentication failed: {0}")]
    Auth(String),

    /// Registry protocol error (unexpected status, transport failure).
    #[error("registry error: {0}")]
    Registry(String),

    /// Container daemon error.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Malformed manifest, unsupported media type, or digest mismatch.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

/// Result type alias for imagekit operations.
pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_not_found_message() {
        let err = ImageError::ImageNotFound {
            field: "label",
            name: "ghcr.io/org/app:latest".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to get label, image 'ghcr.io/org/app:latest' does not exist"
        );
    }

    #[test]
    fn test_previous_layer_message() {
        let err = ImageError::PreviousLayerNotFound("some-bad-sha".to_string());
        assert_eq!(
            err.to_string(),
            "previous image did not have layer with sha 'some-bad-sha'"
        );
    }

    #[test]
    fn test_previous_image_message() {
        let err = ImageError::PreviousImageNotFound("some-bad-repo-name".to_string());
        assert_eq!(
            err.to_string(),
            "failed to get layers for previous image with repo name 'some-bad-repo-name'"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ImageError = io.into();
        assert!(matches!(err, ImageError::Io(_)));
    }
}
