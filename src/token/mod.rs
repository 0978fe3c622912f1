pub mod manager;
pub mod store;
pub mod types;

pub use manager::TokenManager;
pub use store::{FileTokenStore, TokenStorage};
pub use types::{POOL_BASIC, POOL_SUPER, QUOTA_UNLIMITED, TokenPool, TokenRecord, TokenStatus};
