// Utility functions

pub mod clock;
pub mod logger;

pub use clock::*;
pub use logger::*;
