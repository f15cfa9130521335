// ==============================================================================
// lib.rs - Ingest Core Library
// ==============================================================================
// Description: Chunked upload reassembly and task admission for project files
// Author: Matt Barham
// Created: 2026-10-12
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

pub mod chunk_store;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution_log;
pub mod hasher;
pub mod memory;
pub mod merger;
pub mod models;
pub mod postgres;
pub mod progress;
pub mod repository;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod task_queue;
pub mod validator;

pub use error::{IngestError, Result};
