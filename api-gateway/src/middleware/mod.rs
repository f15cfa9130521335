// ==============================================================================
// middleware/mod.rs - API Gateway Middleware Modules
// ==============================================================================
// Description: Caller identity extraction
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-17
// Version: 1.0.0
// ==============================================================================

pub mod auth;

pub use auth::AuthUser;
