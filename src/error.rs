use std::fmt::{self, Display, Formatter};

/// Errors surfaced by engine control operations.
#[derive(Debug)]
pub enum EngineError {
  /// `clear` was requested while the capture was still running; queued
  /// events could still arrive and race the reset.
  CaptureRunning,
  /// The host runtime could not provide the single deferred-job slot.
  DeferredJobUnavailable,
  Json(serde_json::Error),
  /// An object-table probe chain exceeded the hard limit with no usable
  /// slot, which signals table corruption.
  TableCorrupted,
}

impl Display for EngineError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::CaptureRunning => {
        write!(f, "cannot clear while the capture is running")
      }
      Self::DeferredJobUnavailable => {
        write!(f, "host runtime failed to register the deferred job slot")
      }
      Self::Json(err) => {
        write!(f, "failed to encode analysis as json: {err}")
      }
      Self::TableCorrupted => {
        write!(f, "object table probe chain exceeded the hard limit")
      }
    }
  }
}

impl std::error::Error for EngineError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Json(err) => Some(err),
      Self::CaptureRunning
      | Self::DeferredJobUnavailable
      | Self::TableCorrupted => None,
    }
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}
