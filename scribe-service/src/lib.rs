//! Scribe: batch OCR and AI field extraction for scanned correspondence.
//!
//! Each uploaded PDF is rendered to page images, run through OCR with a
//! fallback provider, structured by a language model and appended to a CSV
//! table. Progress and results stream back to the caller as NDJSON.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod fields;
pub mod llm;
pub mod ocr;
pub mod pipeline;
pub mod rasterize;
pub mod service;
pub mod store;
