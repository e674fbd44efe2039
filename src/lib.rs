//! Image Analysis Pipeline
//!
//! This library provides the core functionality for pic-analyzer: users upload
//! images, each image becomes an analysis job on a Redis-backed queue, and
//! workers classify it with one of several ONNX vision models, optionally
//! folding fine-grained labels into coarse categories.

pub mod app_state;
pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
