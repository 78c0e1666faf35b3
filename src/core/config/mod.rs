mod data;
mod merge;
mod validate;

pub use data::*;
pub use merge::merge;
