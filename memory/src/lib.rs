pub mod arena;
pub mod value;

#[cfg(test)]
mod value_tests;

pub use arena::{Arena, Scope};
pub use value::Value;
