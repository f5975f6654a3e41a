//! The built-in request trace reporters.

mod elasticsearch;
mod log;

pub use self::elasticsearch::{ElasticsearchClient, ElasticsearchReporter, IndexSink};
pub use self::log::LogReporter;
