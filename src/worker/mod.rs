//! Crawler and parser workers plus per-host pacing.
pub mod crawler;
pub mod pacer;
pub mod parser;

pub use crawler::CrawlerWorker;
pub use pacer::HostPacer;
pub use parser::{NoopParser, ParserRegistry, ParserWorker};
