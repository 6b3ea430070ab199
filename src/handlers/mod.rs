pub mod characters;
pub mod config;

pub use characters::*;
pub use config::*;
