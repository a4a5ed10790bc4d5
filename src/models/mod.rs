pub mod check;
pub mod proxy;
pub mod query;
pub mod stats;

pub use check::*;
pub use proxy::*;
pub use query::*;
pub use stats::*;
