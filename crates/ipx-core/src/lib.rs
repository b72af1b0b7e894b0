pub mod config;
pub mod model;

pub use config::*;
pub use model::*;

// Rule model and exporter configuration shared by the parser, exporter and CLI
