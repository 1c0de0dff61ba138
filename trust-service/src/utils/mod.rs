pub mod canonical;
pub mod client;

pub use canonical::canonical_json;
pub use client::{user_agent, ClientIp};
