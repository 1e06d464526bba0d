//! # ink2md
//!
//! Imports handwritten notes (scanned images, PDFs, notebook bundles) from
//! watched folders and turns each into a Markdown note with its page images.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │ Collector │──▶│ Freshness │──▶│  Convert  │──▶│ Provider  │
//! │ discovery │   │ cache+hash│   │ raster    │   │ batch/SSE │
//! └───────────┘   └─────┬─────┘   └───────────┘   └─────┬─────┘
//!                       │                               ▼
//!                 ┌─────┴─────┐                   ┌───────────┐
//!                 │  SQLite   │◀── remember ──────│  Output   │
//!                 │  cache    │                   │  folders  │
//!                 └───────────┘                   └───────────┘
//! ```
//!
//! The [`importer::Importer`] runs jobs strictly in sequence and checks the
//! [`controller::ImportController`] cancellation token between steps.
//!
//! ## Quick Start
//!
//! ```bash
//! ink2md init                  # create the fingerprint cache
//! ink2md sources               # check source configurations
//! ink2md import                # import new and changed notes
//! ink2md cache reset --orphans # forget records of removed sources
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors |
//! | [`fingerprint`] | Content digests and file stats |
//! | [`cache`] | Fingerprint record stores |
//! | [`freshness`] | Decides whether a source needs processing |
//! | [`discovery`] | Finds candidate files in watch directories |
//! | [`collector`] | Builds the job queue |
//! | [`convert`] | Rasterizes sources into page images |
//! | [`provider`] | Vision model providers |
//! | [`output`] | Output folders and note files |
//! | [`controller`] | Run state and cancellation |
//! | [`importer`] | Import executor |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod cache_cmd;
pub mod collector;
pub mod config;
pub mod controller;
pub mod convert;
pub mod db;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod freshness;
pub mod importer;
pub mod migrate;
pub mod models;
pub mod output;
pub mod progress;
pub mod provider;
pub mod sources;
