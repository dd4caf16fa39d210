pub mod doubles;
pub mod fixtures;

pub use doubles::*;
pub use fixtures::*;
