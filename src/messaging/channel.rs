/// Names the channel an aggregate type's events travel on. Must be pure:
/// the same (origin, aggregate type) always yields the same channel id.
pub trait MessageChannelParticipant: Send + Sync {
    fn channel_id(&self, origin: &str, aggregate_type: &str) -> String;
}

/// `"origin-aggregateType"`, verbatim.
#[derive(Clone, Debug, Default)]
pub struct InMemoryChannelParticipant;

impl MessageChannelParticipant for InMemoryChannelParticipant {
    fn channel_id(&self, origin: &str, aggregate_type: &str) -> String {
        format!("{}-{}", origin, aggregate_type)
    }
}

// Kafka topic names: at most 249 chars of [a-zA-Z0-9._-]
const MAX_TOPIC_LEN: usize = 249;

/// Kafka-safe topic names: lowercase, anything outside `[a-z0-9._-]`
/// becomes `-`, optionally prefixed, cut to the topic length limit.
#[derive(Clone, Debug, Default)]
pub struct KafkaChannelParticipant {
    prefix: Option<String>,
}

impl KafkaChannelParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
        }
    }

    fn normalize(raw: &str) -> String {
        raw.chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl MessageChannelParticipant for KafkaChannelParticipant {
    fn channel_id(&self, origin: &str, aggregate_type: &str) -> String {
        let raw = match &self.prefix {
            Some(prefix) => format!("{}.{}-{}", prefix, origin, aggregate_type),
            None => format!("{}-{}", origin, aggregate_type),
        };
        let mut topic = Self::normalize(&raw);
        topic.truncate(MAX_TOPIC_LEN);
        topic
    }
}
