pub mod heavykeeper;
pub mod lfu;

pub use heavykeeper::HeavyKeeper;
pub use lfu::{Eviction, LfuCache};
