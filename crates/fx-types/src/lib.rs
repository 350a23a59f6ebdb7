pub mod config;
pub mod errors;
pub mod messages;
pub mod params;

pub use config::*;
pub use errors::*;
pub use messages::*;
pub use params::*;
