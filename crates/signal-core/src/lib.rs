pub mod candidate;
pub mod error;
pub mod outcome;
pub mod scoring;
pub mod traits;
pub mod types;

pub use candidate::*;
pub use error::*;
pub use outcome::*;
pub use traits::*;
pub use types::*;
