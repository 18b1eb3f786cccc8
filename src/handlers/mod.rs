pub mod audio;
pub mod config;
pub mod devices;

pub use audio::*;
pub use config::*;
pub use devices::*;
