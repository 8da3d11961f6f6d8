pub mod flags;

pub use flags::FlagStore;
