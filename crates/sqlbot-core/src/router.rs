//! Deterministic keyword-based intent classification (spec §4.4). No LLM
//! call: latency and cost both matter more here than nuance.

use crate::memory::{Message, Role};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    SqlQuery,
    CsvExport,
    SqlRetrieval,
    OffTopic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
    pub reasoning: String,
}

const CSV_EXPORT_PATTERNS: &[&str] = &[
    r"export.*csv",
    r"save as csv",
    r"download.*csv",
    r"csv file",
];
const SQL_RETRIEVAL_PATTERNS: &[&str] = &[
    r"show.*sql",
    r"what sql",
    r"which sql",
    r"sql.*used",
    r"sql query",
];
const OFF_TOPIC_MARKERS: &[&str] = &["hello", "hi", "how are you", "joke", "weather", "thanks"];
const DB_KEYWORDS: &[&str] = &[
    "app", "apps", "revenue", "install", "country", "platform", "ios", "android", "sql", "data",
    "table", "count", "how many", "what",
];
const FOLLOW_UP_MARKERS: &[&str] = &["what about", "and", "how about", "same for"];

/// Per-thread last-classified intent. `Message` doesn't persist which agent
/// produced it (spec §3 I2), so the router keeps its own small piece of
/// state — separate from `MemoryStore` — to support inheriting SqlQuery or
/// CsvExport on a short follow-up (spec §4.4 step 4).
pub struct Router {
    last_intent: DashMap<String, Intent>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            last_intent: DashMap::new(),
        }
    }

    pub fn classify(&self, thread_id: &str, message: &str, history: &[Message]) -> Classification {
        let classification = self.classify_inner(thread_id, message, history);
        self.last_intent
            .insert(thread_id.to_string(), classification.intent);
        classification
    }

    fn classify_inner(&self, thread_id: &str, message: &str, history: &[Message]) -> Classification {
        let lower = message.to_lowercase();

        if contains_csv_phrase(&lower) {
            return Classification {
                intent: Intent::CsvExport,
                confidence: 0.9,
                reasoning: "message contains a CSV-export phrase".to_string(),
            };
        }

        if contains_sql_retrieval_phrase(&lower) {
            return Classification {
                intent: Intent::SqlRetrieval,
                confidence: 0.9,
                reasoning: "message contains a SQL-retrieval phrase".to_string(),
            };
        }

        let has_off_topic_marker = OFF_TOPIC_MARKERS.iter().any(|m| lower.contains(m));
        let has_db_keyword = DB_KEYWORDS.iter().any(|k| lower.contains(k));
        if has_off_topic_marker && !has_db_keyword {
            return Classification {
                intent: Intent::OffTopic,
                confidence: 0.7,
                reasoning: "greeting/chitchat marker present, no database keyword".to_string(),
            };
        }

        let last_intent = self.last_intent.get(thread_id).map(|r| *r);
        if let Some(inherited) = follow_up_intent(&lower, history, last_intent) {
            return Classification {
                intent: inherited,
                confidence: 0.8,
                reasoning: "short follow-up message inherits prior intent".to_string(),
            };
        }

        Classification {
            intent: Intent::SqlQuery,
            confidence: 0.8,
            reasoning: "default classification".to_string(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn csv_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        CSV_EXPORT_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect()
    })
}

fn sql_retrieval_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        SQL_RETRIEVAL_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect()
    })
}

fn contains_csv_phrase(lower: &str) -> bool {
    csv_patterns().iter().any(|re| re.is_match(lower))
}

fn contains_sql_retrieval_phrase(lower: &str) -> bool {
    sql_retrieval_patterns().iter().any(|re| re.is_match(lower))
}

fn follow_up_intent(lower: &str, history: &[Message], last_intent: Option<Intent>) -> Option<Intent> {
    let word_count = lower.split_whitespace().count();
    if word_count >= 6 {
        return None;
    }
    if !FOLLOW_UP_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }

    history.iter().rev().find(|m| matches!(m.role, Role::Assistant))?;

    match last_intent {
        Some(Intent::SqlQuery) | Some(Intent::CsvExport) => last_intent,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_csv_export() {
        let r = Router::new();
        let c = r.classify("t1", "export this as csv", &[]);
        assert_eq!(c.intent, Intent::CsvExport);
        assert!((c.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn classifies_sql_retrieval() {
        let r = Router::new();
        let c = r.classify("t1", "show me the SQL you used for how many apps", &[]);
        assert_eq!(c.intent, Intent::SqlRetrieval);
    }

    #[test]
    fn classifies_off_topic_without_db_keyword() {
        let r = Router::new();
        let c = r.classify("t1", "Tell me a joke", &[]);
        assert_eq!(c.intent, Intent::OffTopic);
    }

    #[test]
    fn db_keyword_overrides_off_topic_marker() {
        let r = Router::new();
        let c = r.classify("t1", "hi, how many apps do we have", &[]);
        assert_eq!(c.intent, Intent::SqlQuery);
    }

    #[test]
    fn defaults_to_sql_query() {
        let r = Router::new();
        let c = r.classify("t1", "how many apps do we have?", &[]);
        assert_eq!(c.intent, Intent::SqlQuery);
        assert!((c.confidence - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn follow_up_inherits_sql_query_after_assistant_turn() {
        let r = Router::new();
        let history = vec![Message::assistant("49")];
        r.classify("t1", "how many apps do we have?", &history[..0]);
        let c = r.classify("t1", "what about iOS?", &history);
        assert_eq!(c.intent, Intent::SqlQuery);
    }

    #[test]
    fn follow_up_inherits_csv_export_after_assistant_turn() {
        let r = Router::new();
        r.classify("t1", "export this as csv", &[]);
        let history = vec![Message::assistant("exported to apps.csv")];
        let c = r.classify("t1", "same for last week", &history);
        assert_eq!(c.intent, Intent::CsvExport);
    }

    #[test]
    fn follow_up_without_prior_thread_state_falls_back_to_default() {
        let r = Router::new();
        let history = vec![Message::assistant("49")];
        let c = r.classify("unseen-thread", "what about iOS?", &history);
        assert_eq!(c.intent, Intent::SqlQuery);
        assert!((c.confidence - 0.8).abs() < f32::EPSILON);
    }
}
