use crate::topic::message::Message;

/// The identity of a topic as seen by this client: shared by all connections of a subscription
///  or advertisement, and immutable for its lifetime.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopicInfo {
    pub caller_id: String,
    pub topic: String,
    pub type_name: String,
    pub md5sum: String,
    pub definition: String,
}

impl TopicInfo {
    pub fn new(caller_id: &str, topic: &str, type_name: &str, md5sum: &str, definition: &str) -> TopicInfo {
        TopicInfo {
            caller_id: caller_id.to_string(),
            topic: topic.to_string(),
            type_name: type_name.to_string(),
            md5sum: md5sum.to_string(),
            definition: definition.to_string(),
        }
    }

    pub fn for_message<T: Message>(caller_id: &str, topic: &str) -> TopicInfo {
        Self::new(caller_id, topic, T::TYPE_NAME, T::MD5SUM, T::DEFINITION)
    }
}
