use derive_more::{Display, Error};
use std::sync::Arc;

/// Terminal error carried by streams, subjects and operator chains.
///
/// Application failures are normalized into [`StreamError::App`] behind an
/// `Arc` so that a single terminal can fan out to every subscriber of a
/// multicast source.
#[derive(Debug, Clone, Display, Error)]
pub enum StreamError {
    /// A sequence operator required at least one element.
    #[display(fmt = "No elements in sequence")]
    NoElements,
    /// An index-based operator was given a negative index.
    #[display(fmt = "Invalid index")]
    InvalidIndex,
    #[display(fmt = "{}", _0)]
    App(#[error(ignore)] Arc<anyhow::Error>),
}

impl StreamError {
    pub fn app(err: impl Into<anyhow::Error>) -> Self {
        StreamError::App(Arc::new(err.into()))
    }

    pub fn is_no_elements(&self) -> bool {
        matches!(self, StreamError::NoElements)
    }

    pub fn is_invalid_index(&self) -> bool {
        matches!(self, StreamError::InvalidIndex)
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        StreamError::App(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_messages() {
        assert_eq!(StreamError::NoElements.to_string(), "No elements in sequence");
        assert_eq!(StreamError::InvalidIndex.to_string(), "Invalid index");
    }

    #[test]
    fn app_errors_keep_their_message_and_clone() {
        let err = StreamError::app(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.clone().to_string(), "boom");
    }
}
