pub mod actions;
pub mod commands;
pub mod config;
pub mod reducer;
pub mod state;

pub use actions::*;
pub use commands::*;
pub use config::*;
pub use reducer::*;
pub use state::*;
