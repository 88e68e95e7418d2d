/// Usage errors of the client API. They are returned immediately from the call that caused them.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RosError {
    #[error("topic {topic} is already in use with message type {existing}, requested {requested}")]
    TypeMismatch {
        topic: String,
        existing: String,
        requested: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the client is closed")]
    Closed,
}
