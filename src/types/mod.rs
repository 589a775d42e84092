pub mod sample;
pub mod series;
pub mod signal;

pub use sample::*;
pub use series::*;
pub use signal::*;
