pub mod ordered_index;

pub use ordered_index::{AccessOrder, InsertionOrder, OrderedIndex, RecencyMode};
