//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Keep display/CLI layers decoupled from contexts and storage details.

pub mod company_service;
