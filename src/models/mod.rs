pub mod order;
pub mod tracking;
