pub mod dispatcher;
pub mod pool;

pub use dispatcher::*;
pub use pool::*;
