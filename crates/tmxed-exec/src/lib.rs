pub mod channel;
pub mod contracts;
pub mod controller;
pub mod engine;
pub mod error;

#[cfg(test)]
mod testing;

pub use channel::*;
pub use contracts::*;
pub use controller::*;
pub use engine::*;
pub use error::*;
