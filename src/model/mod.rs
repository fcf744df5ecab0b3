pub mod common;
pub mod composite_key;
pub mod events;
pub mod meta;
pub mod record;

pub use common::*;
pub use composite_key::*;
pub use events::*;
pub use meta::*;
pub use record::*;
