//! Mirrorgate - A multi-tenant reverse proxy that mirrors upstream sites
//!
//! This library provides a host-routed mirror server that:
//! - Maps each configured domain (and its subdomains) to one upstream site
//! - Rewrites fetched HTML, CSS and JS so the mirror appears self-hosted
//! - Applies per-site text substitutions, SEO overrides and script conversion
//! - Caches responses on disk and falls back to stale copies when upstream fails
//! - Blocks unwanted crawlers and records visits from the welcome ones
//! - Exposes an admin API for site management backed by SQLite

pub mod admin;
pub mod cache;
pub mod config;
pub mod context;
pub mod convert;
pub mod db;
pub mod error;
pub mod proxy;
pub mod recorder;
pub mod registry;
pub mod request;
pub mod rewrite;
pub mod site;
pub mod transport;
