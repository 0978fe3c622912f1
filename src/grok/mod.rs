pub mod client;
pub mod event;
pub mod headers;
pub mod model;
pub mod usage;
