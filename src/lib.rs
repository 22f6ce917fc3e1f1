//! # Canvas Context
//!
//! Course-material ingestion and confidence-tiered retrieval for AI lesson
//! generation.
//!
//! Canvas Context walks an LMS course, turns heterogeneous documents (HTML
//! pages, assignment descriptions, PDF/PPTX files, linked external web
//! pages) into plain text, incrementally embeds them into SQLite, and
//! resolves generation context with a tiered confidence fallback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │  LMS Walker  │──▶│   Pipeline    │──▶│  SQLite    │
//! │ pages/files/ │   │ Extract+Chunk │   │ chunks +   │
//! │ link crawler │   │   +Embed      │   │ hashes +   │
//! └──────────────┘   └──────────────┘   │ progress   │
//!                                       └─────┬─────┘
//!                            ┌────────────────┤
//!                            ▼                ▼
//!                      ┌──────────┐    ┌────────────┐
//!                      │ Retrieval │    │ Sync state │
//!                      │ +Fallback │    │  (polled)  │
//!                      └──────────┘    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cvx init                        # create database
//! cvx sync                        # walk every course, embed, store
//! cvx status                      # poll sync progress
//! cvx retrieve "binary search"    # top-K chunks for a topic
//! cvx context "binary search"     # tiered generation context
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`lms`] | Canvas API client |
//! | [`walk`] | Course walker |
//! | [`crawl`] | Bounded link crawler |
//! | [`extract`] | HTML/PDF/PPTX text extraction |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Incremental material store |
//! | [`retrieval`] | Top-K vector retrieval |
//! | [`fallback`] | Tiered retrieval fallback |
//! | [`websearch`] | Optional web-search capability |
//! | [`sync`] | Resumable sync state machine |
//! | [`progress`] | Stderr progress reporters |
//! | [`blob`] | Original-binary blob storage |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod blob;
pub mod chunk;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod fallback;
pub mod lms;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieval;
pub mod store;
pub mod sync;
pub mod walk;
pub mod websearch;
