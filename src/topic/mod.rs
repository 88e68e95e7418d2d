pub mod endpoint;
pub mod message;
pub mod names;
pub mod topic_info;
