pub mod id;
pub mod tokens;
