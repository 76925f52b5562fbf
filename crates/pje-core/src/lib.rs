//! Core building blocks for the PJe retrieval engine: configuration, HTTP
//! transport with manual redirect handling, session persistence, CNJ number
//! handling, page-scraping helpers, and the report/data model.

pub mod client;
pub mod cnj;
pub mod config;
pub mod report;
pub mod scrape;
pub mod session;
pub mod types;

pub use client::{ApiResponse, PageResponse, SessionClient};
pub use cnj::{CaseNumber, CaseNumberParts};
pub use config::{resolve_credentials, EngineConfig};
pub use report::{Integrity, ProcessingReport, RetryStats, RunStatus};
pub use session::SessionStore;
pub use types::{
    AuthenticatedUser, CaseSummary, DeliveryMode, DownloadAvailability, DownloadOutcome,
    FailureKind, Profile, ResolutionResult, SubjectGroup, Tag, TaskQueue,
};
