//! Repository implementations for database operations

pub mod candles;
pub mod jobs;
pub mod patterns;
pub mod runs;

pub use candles::*;
pub use jobs::*;
pub use patterns::*;
pub use runs::*;
