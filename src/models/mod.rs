pub mod endpoint;
pub mod record;

pub use endpoint::*;
pub use record::*;
