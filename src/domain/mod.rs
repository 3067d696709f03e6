pub mod events;
pub mod normalizer;
pub mod records;

pub use events::*;
pub use normalizer::{NormalizeError, NormalizedOrder, NormalizedProduct};
pub use records::*;
