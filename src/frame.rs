use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use serde::Serialize;

/// Metadata describing a single frame of a captured call path.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct FrameMetadata {
  pub path: Arc<str>,
  pub label: Arc<str>,
  pub lineno: u32,
}

impl FrameMetadata {
  #[must_use]
  pub fn new(
    path: impl Into<String>,
    label: impl Into<String>,
    lineno: u32,
  ) -> Self {
    Self {
      path: Arc::<str>::from(path.into()),
      label: Arc::<str>::from(label.into()),
      lineno,
    }
  }

  /// Stable key used to deduplicate shared call-path prefixes.
  #[must_use]
  pub fn key(&self) -> String {
    if self.label.is_empty() {
      format!("{}:{}", self.path, self.lineno)
    } else {
      format!("{}:{} in {}", self.path, self.lineno, self.label)
    }
  }
}

impl Display for FrameMetadata {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.key())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_includes_label_when_present() {
    let frame = FrameMetadata::new("app/worker.rb", "run", 42);
    assert_eq!(frame.key(), "app/worker.rb:42 in run");
  }

  #[test]
  fn key_omits_empty_label() {
    let frame = FrameMetadata::new("app/worker.rb", "", 42);
    assert_eq!(frame.key(), "app/worker.rb:42");
  }
}
