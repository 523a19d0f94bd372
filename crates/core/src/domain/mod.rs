pub mod candidate;
pub mod rollout;
pub mod traffic;
