//! Core data models used throughout the pipeline.
//!
//! These types represent the materials, chunks, and retrieval results that
//! flow from the LMS walk through chunking/embedding and out of retrieval.

use serde::Serialize;

/// How a material entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Native LMS content (page, assignment, file).
    Native,
    /// Discovered by following a hyperlink out of LMS content.
    Linked,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Native => "native",
            Provenance::Linked => "linked",
        }
    }
}

/// The kind of source content a material was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Page,
    Assignment,
    File,
    CrawledPage,
}

impl MaterialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialKind::Page => "page",
            MaterialKind::Assignment => "assignment",
            MaterialKind::File => "file",
            MaterialKind::CrawledPage => "crawled-page",
        }
    }
}

/// One unit of extracted course content, before chunking.
///
/// `item_id` is unique within a course: the LMS item id for native content,
/// a content-derived hash id for crawled pages. Materials with empty text
/// are discarded before they reach the store.
#[derive(Debug, Clone)]
pub struct Material {
    pub item_id: String,
    pub kind: MaterialKind,
    pub text: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub module_name: Option<String>,
    pub provenance: Provenance,
    /// For crawled pages: the item id of the material that linked to it.
    pub linked_from: Option<String>,
}

/// A bounded slice of a material's text, carrying one embedding vector and
/// a copy of the parent material's metadata.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// `{item_id}-chunk-{n}`; indices are dense from 0.
    pub id: String,
    pub item_id: String,
    pub chunk_index: i64,
    pub text: String,
}

/// A stored chunk returned by the retrieval service, plus its similarity
/// score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RetrievedMaterial {
    pub chunk_id: String,
    pub item_id: String,
    pub text: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub module_name: Option<String>,
    pub score: f64,
}

/// Counters returned by one course's store pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOutcome {
    pub materials_stored: u64,
    pub chunks_created: u64,
}

/// Fallback confidence level chosen by the retrieval orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// Strong match: retrieved chunks used verbatim.
    None,
    /// Partial match: retrieved chunks used with a disclaimer.
    Partial,
    /// Weak or no match, web snippets merged in.
    WebSearch,
    /// No usable context at all; general-knowledge instruction substituted.
    General,
}

impl FallbackTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::None => "none",
            FallbackTier::Partial => "partial",
            FallbackTier::WebSearch => "web_search",
            FallbackTier::General => "general",
        }
    }
}

/// Provenance entry attached to every resolved context, regardless of tier.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSource {
    pub title: String,
    pub url: Option<String>,
    pub relevance: f64,
}

/// The composed generation context handed to lesson generation.
#[derive(Debug, Clone, Serialize)]
pub struct LessonContext {
    pub content: String,
    pub sources: Vec<ContextSource>,
    pub tier: FallbackTier,
    pub disclaimer: Option<String>,
}
