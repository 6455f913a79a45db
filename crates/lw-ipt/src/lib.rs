pub mod backend;
pub mod diff;
pub mod restore;

pub use backend::*;
pub use diff::*;
pub use restore::*;
