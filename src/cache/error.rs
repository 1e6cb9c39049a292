use color_eyre::Report;
use std::sync::Arc;

/// A failure from the transport or from decoding its response.
///
/// Cloneable so every caller coalesced onto one request receives the same
/// error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream failure: {0}")]
pub struct UpstreamError(Arc<Report>);

impl UpstreamError {
  pub fn report(&self) -> &Report {
    &self.0
  }
}

impl From<Report> for UpstreamError {
  fn from(report: Report) -> Self {
    Self(Arc::new(report))
  }
}
