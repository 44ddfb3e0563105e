//! Tracing subscriber setup used by the Moodle Solr tenant toolkit.
pub mod tracing;

pub use tracing::Tracing;
