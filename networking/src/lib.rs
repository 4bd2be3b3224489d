pub mod propagation;
pub mod sync;
pub mod types;
