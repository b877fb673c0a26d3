//! Downstream playlist assembly

pub mod filter_engine;
pub mod generator;

pub use filter_engine::ChannelNameFilter;
pub use generator::PlaylistGenerator;
