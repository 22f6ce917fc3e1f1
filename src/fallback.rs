//! Tiered Retrieval Fallback Orchestrator.
//!
//! Decides, from the confidence of the top retrieval hit, whether lesson
//! generation gets course chunks verbatim, chunks with a partial-match
//! disclaimer, a merge of web snippets and weak chunks, or a fixed
//! general-knowledge instruction. Every path carries normalized sources so
//! the consumer can render provenance regardless of tier, and no path
//! surfaces a hard error: the general tier is the guaranteed floor.

use sqlx::SqlitePool;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::models::{ContextSource, FallbackTier, LessonContext, RetrievedMaterial};
use crate::retrieval;
use crate::websearch::WebSearchProvider;

/// Instruction substituted when neither course material nor web search
/// produced usable context.
const GENERAL_KNOWLEDGE_INSTRUCTION: &str = "No course material matched this topic. Teach it from general subject knowledge. Do not invent course-specific details such as policies, deadlines, grading rules, or instructor statements. Open the response by stating that the course material did not cover this topic.";

const PARTIAL_DISCLAIMER: &str =
    "Course material only partially matches this topic; parts of the lesson may generalize beyond the retrieved content.";

const WEB_SEARCH_DISCLAIMER: &str =
    "This context includes web search results. Verify specifics against the official course material.";

const GENERAL_DISCLAIMER: &str =
    "No course-specific material was found for this topic; the response is based on general knowledge and must open by disclosing that.";

pub struct ContextResolver<'a> {
    pub pool: &'a SqlitePool,
    /// `None` when embeddings are disabled; retrieval then yields nothing
    /// and resolution starts at the web tier.
    pub embedder: Option<&'a dyn Embedder>,
    pub search: Option<&'a dyn WebSearchProvider>,
    pub config: &'a RetrievalConfig,
}

impl<'a> ContextResolver<'a> {
    /// Resolve generation context for `topic` within `course_id`. Never
    /// fails: errors along the way degrade the tier instead.
    pub async fn resolve_context(&self, course_id: &str, topic: &str) -> LessonContext {
        let chunks = match self.embedder {
            Some(embedder) => {
                match retrieval::top_chunks(self.pool, embedder, course_id, topic, self.config.top_k)
                    .await
                {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        eprintln!("Warning: retrieval failed for '{}': {}", topic, e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let top_score = chunks.first().map(|c| c.score);

        match decide(top_score, self.config) {
            TierDecision::Strong => {
                return LessonContext {
                    content: join_chunks(&chunks),
                    sources: chunk_sources(&chunks),
                    tier: FallbackTier::None,
                    disclaimer: None,
                };
            }
            TierDecision::Partial => {
                return LessonContext {
                    content: join_chunks(&chunks),
                    sources: chunk_sources(&chunks),
                    tier: FallbackTier::Partial,
                    disclaimer: Some(PARTIAL_DISCLAIMER.to_string()),
                };
            }
            TierDecision::Weak => {}
        }

        // Weak or no local hits. Try the secondary web-search capability;
        // its absence and its failures both fall through to general.
        if let Some(search) = self.search {
            match search.search(topic).await {
                Ok(results) if !results.is_empty() => {
                    let mut content = String::new();
                    let mut sources = Vec::new();
                    for r in &results {
                        if !content.is_empty() {
                            content.push_str("\n\n");
                        }
                        content.push_str(&format!("{}\n{}", r.title, r.snippet));
                        sources.push(ContextSource {
                            title: r.title.clone(),
                            url: Some(r.url.clone()),
                            relevance: r.relevance,
                        });
                    }
                    // Weak local chunks still ride along for whatever
                    // course flavor they carry.
                    if !chunks.is_empty() {
                        content.push_str("\n\n");
                        content.push_str(&join_chunks(&chunks));
                        sources.extend(chunk_sources(&chunks));
                    }
                    return LessonContext {
                        content,
                        sources,
                        tier: FallbackTier::WebSearch,
                        disclaimer: Some(WEB_SEARCH_DISCLAIMER.to_string()),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("Warning: web search failed for '{}': {}", topic, e);
                }
            }
        }

        LessonContext {
            content: GENERAL_KNOWLEDGE_INSTRUCTION.to_string(),
            sources: Vec::new(),
            tier: FallbackTier::General,
            disclaimer: Some(GENERAL_DISCLAIMER.to_string()),
        }
    }
}

/// The confidence band the top retrieval score lands in. Thresholds are
/// inclusive: a score exactly at the strong threshold is a strong match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierDecision {
    Strong,
    Partial,
    Weak,
}

fn decide(top_score: Option<f64>, config: &RetrievalConfig) -> TierDecision {
    match top_score {
        Some(s) if s >= config.strong_threshold => TierDecision::Strong,
        Some(s) if s >= config.weak_threshold => TierDecision::Partial,
        _ => TierDecision::Weak,
    }
}

fn join_chunks(chunks: &[RetrievedMaterial]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn chunk_sources(chunks: &[RetrievedMaterial]) -> Vec<ContextSource> {
    chunks
        .iter()
        .map(|c| ContextSource {
            title: c
                .title
                .clone()
                .unwrap_or_else(|| c.item_id.clone()),
            url: c.source_url.clone(),
            relevance: c.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbedPurpose, Embedder as EmbedderTrait};
    use crate::websearch::WebSearchResult;
    use anyhow::Result;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// Embeds every text to a fixed unit vector; chunk rows are seeded with
    /// vectors chosen to produce an exact cosine score against it.
    struct UnitEmbedder;

    #[async_trait]
    impl EmbedderTrait for UnitEmbedder {
        async fn embed(&self, texts: &[String], _purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0f32, 0.0]).collect())
        }
    }

    struct FixedSearch {
        results: Vec<WebSearchResult>,
    }

    #[async_trait]
    impl WebSearchProvider for FixedSearch {
        async fn search(&self, _topic: &str) -> Result<Vec<WebSearchResult>> {
            Ok(self.results.clone())
        }
    }

    async fn pool_with_chunk(score: f64) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        // cos([1,0], [score, sqrt(1-score^2)]) == score
        let y = (1.0 - score * score).sqrt() as f32;
        let blob = crate::embedding::vec_to_blob(&[score as f32, y]);
        sqlx::query(
            "INSERT INTO chunks (course_id, id, item_id, chunk_index, text, title, source_url, module_name, provenance, linked_from, content_kind, embedding, dims, created_at)
             VALUES ('c1', 'm-chunk-0', 'm', 0, 'stored chunk text', 'Stored title', 'https://lms.test/p', NULL, 'native', NULL, 'page', ?, 2, 0)",
        )
        .bind(blob)
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[test]
    fn tier_selection_is_deterministic_at_thresholds() {
        let config = RetrievalConfig::default();
        assert_eq!(decide(Some(0.70), &config), TierDecision::Strong);
        assert_eq!(decide(Some(0.69), &config), TierDecision::Partial);
        assert_eq!(decide(Some(0.40), &config), TierDecision::Partial);
        assert_eq!(decide(Some(0.39), &config), TierDecision::Weak);
        assert_eq!(decide(None, &config), TierDecision::Weak);
    }

    #[tokio::test]
    async fn strong_match_is_tier_none() {
        let pool = pool_with_chunk(0.90).await;
        let embedder = UnitEmbedder;
        let config = RetrievalConfig::default();
        let resolver = ContextResolver {
            pool: &pool,
            embedder: Some(&embedder),
            search: None,
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "topic").await;
        assert_eq!(ctx.tier, FallbackTier::None);
        assert!(ctx.disclaimer.is_none());
        assert_eq!(ctx.content, "stored chunk text");
        assert_eq!(ctx.sources.len(), 1);
        assert_eq!(ctx.sources[0].title, "Stored title");
    }

    #[tokio::test]
    async fn middling_match_is_partial() {
        let pool = pool_with_chunk(0.55).await;
        let embedder = UnitEmbedder;
        let config = RetrievalConfig::default();
        let resolver = ContextResolver {
            pool: &pool,
            embedder: Some(&embedder),
            search: None,
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "topic").await;
        assert_eq!(ctx.tier, FallbackTier::Partial);
        assert!(ctx.disclaimer.is_some());
    }

    #[tokio::test]
    async fn weak_score_without_web_results_is_general() {
        let pool = pool_with_chunk(0.20).await;
        let embedder = UnitEmbedder;
        let config = RetrievalConfig::default();
        let resolver = ContextResolver {
            pool: &pool,
            embedder: Some(&embedder),
            search: None,
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "topic").await;
        assert_eq!(ctx.tier, FallbackTier::General);
        assert!(ctx.content.contains("general subject knowledge"));
        assert!(ctx.sources.is_empty());
    }

    #[tokio::test]
    async fn weak_score_with_web_results_merges_both() {
        let pool = pool_with_chunk(0.30).await;
        let embedder = UnitEmbedder;
        let config = RetrievalConfig::default();
        let search = FixedSearch {
            results: vec![WebSearchResult {
                title: "Web hit".to_string(),
                url: "https://web.test/a".to_string(),
                snippet: "web snippet".to_string(),
                relevance: 0.9,
            }],
        };
        let resolver = ContextResolver {
            pool: &pool,
            embedder: Some(&embedder),
            search: Some(&search),
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "topic").await;
        assert_eq!(ctx.tier, FallbackTier::WebSearch);
        assert!(ctx.content.contains("web snippet"));
        assert!(ctx.content.contains("stored chunk text"));
        assert_eq!(ctx.sources.len(), 2);
        assert_eq!(ctx.sources[0].url.as_deref(), Some("https://web.test/a"));
    }

    #[tokio::test]
    async fn no_chunks_no_search_is_general_floor() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let config = RetrievalConfig::default();
        let resolver = ContextResolver {
            pool: &pool,
            embedder: None,
            search: None,
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "anything").await;
        assert_eq!(ctx.tier, FallbackTier::General);
        assert!(ctx.disclaimer.is_some());
    }

    #[tokio::test]
    async fn empty_web_results_fall_through_to_general() {
        let pool = pool_with_chunk(0.10).await;
        let embedder = UnitEmbedder;
        let config = RetrievalConfig::default();
        let search = FixedSearch { results: vec![] };
        let resolver = ContextResolver {
            pool: &pool,
            embedder: Some(&embedder),
            search: Some(&search),
            config: &config,
        };
        let ctx = resolver.resolve_context("c1", "topic").await;
        assert_eq!(ctx.tier, FallbackTier::General);
    }
}
