pub mod order;
pub mod presence;
