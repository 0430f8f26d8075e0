//! Memory Integration: graph-store read enrichment and interaction write-back.
//!
//! Grounded on `original_source/core/neo4j_memory_integration.py`'s
//! `Neo4jMemoryIntegration`. The original's hardcoded single-user profile
//! detection ("Diego") is generalized to a name-detection heuristic over
//! whichever user happens to be talking; the keyword extraction, context
//! shape, and prompt-composition rules are kept as-is. `neo4rs` is the only
//! Cypher-capable driver in the corpus (see DESIGN.md) and is used here the
//! way `crate::cache` is used elsewhere: behind an `Arc`, constructed once
//! at startup.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::config::Neo4jConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub user_profile: Option<UserProfile>,
    pub recent_interactions: Vec<String>,
    pub relevant_memories: Vec<MemoryNodeSummary>,
    pub learned_patterns: Vec<LearnedPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNodeSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern: String,
    pub description: String,
    pub category: String,
}

const STOPWORDS: &[&str] = &[
    "o", "a", "de", "da", "do", "em", "para", "com", "que", "e", "um", "uma", "the", "and", "for",
];

/// Lowercases, tokenizes on runs of ≥3 word characters, drops stopwords,
/// returns up to 5 unique keywords.
fn extract_keywords(text: &str) -> Vec<String> {
    static WORD_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b\w{3,}\b").expect("static word pattern is valid"));
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let lower = text.to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for m in WORD_PATTERN.find_iter(&lower) {
        let word = m.as_str();
        if stopwords.contains(word) || !seen.insert(word.to_string()) {
            continue;
        }
        keywords.push(word.to_string());
        if keywords.len() == 5 {
            break;
        }
    }
    keywords
}

static NAME_ANNOUNCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:name is|my name's|i'm|i am)\s+(\w+)")
        .expect("static name-announce pattern is valid")
});

fn detect_announced_name(user_message: &str) -> Option<String> {
    NAME_ANNOUNCE_PATTERN
        .captures(user_message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Lightweight heuristic summary: capitalized tokens, question detection,
/// imperative-verb detection, otherwise none.
fn summarize(user_message: &str) -> Option<String> {
    static CAP_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+\b").expect("static cap pattern is valid"));

    if user_message.contains('?') {
        let preview: String = user_message.chars().take(50).collect();
        return Some(format!("question: {preview}"));
    }
    let imperative = ["create", "build", "need", "want", "crie", "faça", "preciso", "quero"];
    if imperative
        .iter()
        .any(|w| user_message.to_lowercase().contains(w))
    {
        return Some("task request".to_string());
    }
    if CAP_PATTERN.is_match(user_message) {
        return Some("mentions named entities".to_string());
    }
    None
}

fn cache_tag(session_id: &str) -> String {
    format!("memory:{session_id}")
}

fn cache_key(session_id: &str, query: Option<&str>) -> String {
    format!("memory:{session_id}:{}", query.unwrap_or("_"))
}

/// Read/write gateway into the memory graph store. Constructed once at
/// startup; when `config.enabled()` is false (no password configured),
/// every operation degrades to a no-op rather than failing.
pub struct MemoryIntegration {
    graph: Option<neo4rs::Graph>,
    cache: std::sync::Arc<Cache>,
}

impl MemoryIntegration {
    pub async fn connect(
        config: &Neo4jConfig,
        cache: std::sync::Arc<Cache>,
    ) -> Self {
        if !config.enabled() {
            return Self { graph: None, cache };
        }
        let uri = config.uri.as_deref().unwrap_or("bolt://localhost:7687");
        let user = config.user.as_deref().unwrap_or("neo4j");
        let password = config.password.as_deref().unwrap_or_default();
        let database = config.database.clone();

        let mut builder = neo4rs::ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password);
        if let Some(db) = database {
            builder = builder.db(db);
        }

        match builder.build() {
            Ok(cfg) => match neo4rs::Graph::connect(cfg).await {
                Ok(graph) => {
                    tracing::info!(uri, "connected to memory graph store");
                    Self {
                        graph: Some(graph),
                        cache,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "memory graph store unreachable, degrading silently");
                    Self { graph: None, cache }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid memory graph store config, degrading silently");
                Self { graph: None, cache }
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.graph.is_some()
    }

    /// Runs the bounded read queries and merges them into a context object.
    /// Any graph failure degrades to an empty context; never propagated.
    pub async fn get_user_context(
        &self,
        session_id: &str,
        query: Option<&str>,
    ) -> MemoryContext {
        let Some(graph) = &self.graph else {
            return MemoryContext::default();
        };

        let key = cache_key(session_id, query);
        if let Some(cached) = self.cache.get::<MemoryContext>(&key).await {
            return cached;
        }

        let context = match self.query_context(graph, session_id, query).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(error = %e, "memory context read failed, degrading to empty context");
                MemoryContext::default()
            }
        };

        self.cache
            .set(&key, &context, None, &[&cache_tag(session_id)])
            .await;
        context
    }

    async fn query_context(
        &self,
        graph: &neo4rs::Graph,
        session_id: &str,
        query: Option<&str>,
    ) -> Result<MemoryContext, neo4rs::Error> {
        let mut context = MemoryContext::default();

        // (a) user-profile lookup, against the `User` node `save_interaction`
        // upserts on a name announcement.
        let mut profile_rows = graph
            .execute(
                neo4rs::query("MATCH (u:User {session_id: $session_id}) RETURN u.name AS name")
                    .param("session_id", session_id),
            )
            .await?;
        if let Ok(Some(row)) = profile_rows.next().await {
            if let Ok(name) = row.get::<String>("name") {
                context.user_profile = Some(UserProfile {
                    name: Some(name),
                    username: None,
                });
            }
        }

        // recent interactions for this session, most recent first.
        let mut recent = graph
            .execute(
                neo4rs::query(
                    "MATCH (n:Learning {session_id: $session_id}) \
                     RETURN n.user_message AS user_message \
                     ORDER BY n.created_at DESC LIMIT 5",
                )
                .param("session_id", session_id),
            )
            .await?;
        while let Ok(Some(row)) = recent.next().await {
            let message: String = row.get("user_message").unwrap_or_default();
            if !message.is_empty() {
                context.recent_interactions.push(message);
            }
        }

        if let Some(q) = query {
            let keywords = extract_keywords(q);
            if !keywords.is_empty() {
                let mut result = graph
                    .execute(
                        neo4rs::query(
                            "MATCH (n:Learning) \
                             WHERE ANY(keyword IN $keywords WHERE \
                                toLower(n.name) CONTAINS toLower(keyword) OR \
                                toLower(n.description) CONTAINS toLower(keyword)) \
                             RETURN n.name AS name, n.description AS description \
                             ORDER BY n.created_at DESC LIMIT 10",
                        )
                        .param("keywords", keywords),
                    )
                    .await?;
                while let Ok(Some(row)) = result.next().await {
                    let name: String = row.get("name").unwrap_or_default();
                    let description: String = row.get("description").unwrap_or_default();
                    context
                        .relevant_memories
                        .push(MemoryNodeSummary { name, description });
                }
            }
        }

        let mut patterns = graph
            .execute(neo4rs::query(
                "MATCH (n:Learning) \
                 WHERE n.type IN ['successful_implementation', 'verified_solution', 'best_practice'] \
                 RETURN n.name AS name, n.description AS description, n.category AS category \
                 ORDER BY n.created_at DESC LIMIT 5",
            ))
            .await?;
        while let Ok(Some(row)) = patterns.next().await {
            context.learned_patterns.push(LearnedPattern {
                pattern: row.get("name").unwrap_or_default(),
                description: row.get("description").unwrap_or_default(),
                category: row.get("category").unwrap_or_default(),
            });
        }

        Ok(context)
    }

    /// Writes a single Learning node for this turn and upserts a user node
    /// if a personal name was announced. Failures are logged, never
    /// surfaced. Invalidates the session's cached context on success.
    pub async fn save_interaction(
        &self,
        session_id: &str,
        user_message: &str,
        assistant_response: &str,
    ) {
        let Some(graph) = &self.graph else {
            return;
        };

        let summary = summarize(user_message).unwrap_or_else(|| "chat interaction".to_string());
        let description: String = user_message.chars().take(500).collect();
        let truncated_user: String = user_message.chars().take(500).collect();
        let truncated_assistant: String = assistant_response.chars().take(1000).collect();
        let entities = extract_keywords(user_message);
        let entities_json = serde_json::to_string(&entities).unwrap_or_default();

        let write = graph
            .run(
                neo4rs::query(
                    "CREATE (n:Learning { \
                        name: $name, type: 'conversation', description: $description, \
                        user_message: $user_message, assistant_response: $assistant_response, \
                        session_id: $session_id, extracted_entities: $entities, \
                        created_at: datetime(), category: 'chat_interaction' \
                     })",
                )
                .param("name", summary)
                .param("description", description)
                .param("user_message", truncated_user)
                .param("assistant_response", truncated_assistant)
                .param("session_id", session_id)
                .param("entities", entities_json),
            )
            .await;

        if let Err(e) = write {
            tracing::warn!(error = %e, session_id, "memory interaction write failed");
            return;
        }

        if let Some(name) = detect_announced_name(user_message) {
            let upsert = graph
                .run(
                    neo4rs::query(
                        "MERGE (u:User {session_id: $session_id}) \
                         SET u.name = $name, u.last_interaction = datetime()",
                    )
                    .param("session_id", session_id)
                    .param("name", name),
                )
                .await;
            if let Err(e) = upsert {
                tracing::debug!(error = %e, "user profile upsert failed");
            }
        }

        self.cache.invalidate_tag(&cache_tag(session_id)).await;
    }

    /// Renders context into the fixed-shape prompt prefix. Empty sub-blocks
    /// are omitted; returns an empty string if nothing is relevant.
    pub fn format_context_for_prompt(&self, context: &MemoryContext) -> String {
        let mut parts = Vec::new();

        if let Some(profile) = &context.user_profile {
            if let Some(name) = &profile.name {
                parts.push(format!(
                    "User: {name} (@{})",
                    profile.username.as_deref().unwrap_or("unknown")
                ));
            }
        }

        if !context.relevant_memories.is_empty() {
            let mut block = String::from("Relevant context:\n");
            for mem in context.relevant_memories.iter().take(3) {
                block.push_str("- ");
                block.push_str(&mem.name);
                if !mem.description.is_empty() {
                    let preview: String = mem.description.chars().take(100).collect();
                    block.push_str(": ");
                    block.push_str(&preview);
                }
                block.push('\n');
            }
            parts.push(block);
        }

        if !context.learned_patterns.is_empty() {
            let mut block = String::from("Known patterns:\n");
            for pattern in context.learned_patterns.iter().take(2) {
                block.push_str("- ");
                block.push_str(&pattern.pattern);
                block.push('\n');
            }
            parts.push(block);
        }

        if parts.is_empty() {
            String::new()
        } else {
            format!("{}\n---\n", parts.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_keywords_drops_stopwords_and_dedupes() {
        let keywords = extract_keywords("the cat sat on the mat and the cat ran");
        assert!(keywords.contains(&"cat".to_string()));
        assert!(keywords.contains(&"sat".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(keywords.len() <= 5);
    }

    #[test]
    fn detect_announced_name_finds_pattern() {
        assert_eq!(
            detect_announced_name("hi, my name is Avery"),
            Some("Avery".to_string())
        );
        assert_eq!(detect_announced_name("no name here"), None);
    }

    #[test]
    fn summarize_detects_question() {
        assert!(summarize("what time is it?").unwrap().starts_with("question"));
    }

    #[test]
    fn summarize_detects_task_request() {
        assert_eq!(summarize("please create a report"), Some("task request".to_string()));
    }

    #[test]
    fn format_context_omits_empty_blocks() {
        let graph_stub = MemoryIntegration {
            graph: None,
            cache: Cache::new(10, std::time::Duration::from_secs(60), 1024),
        };
        let context = MemoryContext::default();
        assert_eq!(graph_stub.format_context_for_prompt(&context), "");
    }

    #[test]
    fn format_context_includes_profile_and_memories() {
        let graph_stub = MemoryIntegration {
            graph: None,
            cache: Cache::new(10, std::time::Duration::from_secs(60), 1024),
        };
        let context = MemoryContext {
            user_profile: Some(UserProfile {
                name: Some("Avery".into()),
                username: Some("av".into()),
            }),
            relevant_memories: vec![MemoryNodeSummary {
                name: "topic".into(),
                description: "detail".into(),
            }],
            ..Default::default()
        };
        let rendered = graph_stub.format_context_for_prompt(&context);
        assert!(rendered.contains("Avery"));
        assert!(rendered.contains("topic"));
    }
}
