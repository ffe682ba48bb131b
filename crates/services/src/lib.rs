#![forbid(unsafe_code)]
//! Orchestration over `pathway_core` and `storage`: graph editing, progress
//! flows, prerequisite queries and unlock propagation.

pub mod app_services;
pub mod catalog_service;
mod context;
pub mod error;
pub mod graph_service;
pub mod locks;
pub mod prerequisite_service;
pub mod progress_service;
pub mod unlock_engine;

pub use pathway_core::Clock;

pub use app_services::AppServices;
pub use catalog_service::CatalogService;
pub use error::{AppServicesError, CatalogServiceError, GraphServiceError, ProgressServiceError};
pub use graph_service::GraphService;
pub use locks::{GraphGuard, GraphLocks};
pub use prerequisite_service::PrerequisiteService;
pub use progress_service::{CompletionOutcome, Gated, ProgressService, SubmissionOutcome};
pub use unlock_engine::{RecalcReport, UnlockEngine};
