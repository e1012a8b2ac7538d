//! Topic-to-KEK resolution: topics with no mapping pass through the
//! filter untouched.

use std::collections::HashMap;

use crate::config::KekSelectorConfig;

pub trait KekSelector: Send + Sync {
    fn kek_for_topic(&self, topic: &str) -> Option<String>;
}

/// The only selector kind this crate ships: a static topic-name table
/// loaded from config, realised per `config.rs`'s JSON encoding.
pub struct TopicNameKekSelector {
    topic_to_kek: HashMap<String, String>,
}

impl TopicNameKekSelector {
    pub fn new(topic_to_kek: HashMap<String, String>) -> Self {
        TopicNameKekSelector { topic_to_kek }
    }

    pub fn from_config(config: &KekSelectorConfig) -> Self {
        TopicNameKekSelector::new(config.topic_to_kek.clone())
    }
}

impl KekSelector for TopicNameKekSelector {
    fn kek_for_topic(&self, topic: &str) -> Option<String> {
        self.topic_to_kek.get(topic).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_topic_has_no_kek() {
        let selector = TopicNameKekSelector::new(HashMap::new());
        assert_eq!(selector.kek_for_topic("orders"), None);
    }

    #[test]
    fn mapped_topic_resolves() {
        let mut map = HashMap::new();
        map.insert("orders".to_string(), "kek-1".to_string());
        let selector = TopicNameKekSelector::new(map);
        assert_eq!(selector.kek_for_topic("orders"), Some("kek-1".to_string()));
    }
}
