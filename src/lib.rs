//! # Wisp
//!
//! A discovery and routing gateway for the MCP server ecosystem.
//!
//! Wisp ingests server metadata from the upstream registry, enriches it with
//! popularity and usage signals from independent sources, ranks servers by a
//! weighted blend of backlinks, reputation, activity, and reach, indexes
//! their tools for hybrid (keyword + semantic) retrieval, and exposes a
//! search + tool-invocation HTTP gateway to agents.
//!
//! ## Architecture
//!
//! ```text
//! Registry → Enrichment → Backlink Scoring → Market Ranking → Index → Gateway
//!    (ingest)  (per-source)    (edges)          (pillars)     (FTS+vec)  (HTTP)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — registry record types and the failure taxonomy
//! - [`db`] — SQLite connection management (WAL, busy timeout, extensions)
//! - [`migrate`] — idempotent schema and derived views
//! - [`fetch`] — outbound HTTP with retry, backoff, and rate-limit handling
//! - [`ingest`] — upstream registry ingest and curated seeding
//! - [`enrich`] — per-source enrichment workers
//! - [`backlink`] — tiered backlink-edge scoring and normalisation
//! - [`ranking`] — four-pillar marketplace ranking
//! - [`index`] — search-doc construction, FTS rebuild, embedding backfill
//! - [`embedding`] — warm-once embedding engine and vector utilities
//! - [`search`] — hybrid retrieval, fusion, and hydration
//! - [`extract`] — tool/resource/prompt extraction over MCP
//! - [`invoke`] — connection resolution and bounded tool invocation
//! - [`gateway`] — the HTTP surface (Axum)

pub mod backlink;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod extract;
pub mod fetch;
pub mod gateway;
pub mod index;
pub mod ingest;
pub mod invoke;
pub mod migrate;
pub mod models;
pub mod ranking;
pub mod search;
