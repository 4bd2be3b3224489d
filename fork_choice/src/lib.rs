pub mod block_cache;
pub mod handlers;
pub mod helpers;
pub mod store;
pub mod validator;

pub use block_cache::*;
pub use handlers::*;
pub use helpers::*;
pub use store::*;
pub use validator::*;
