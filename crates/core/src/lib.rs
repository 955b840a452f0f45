//! # office-pdf-core
//!
//! Reliable Office document to PDF conversion through an out-of-process
//! office suite.
//!
//! The conversion itself is done by the office application. This crate is
//! about operating that application safely:
//!
//! - **Ownership tracking** so cleanup never touches instances the user
//!   already had open
//! - **Scoped release** of every host object reference, on every exit path
//! - **Session pooling** with use-count, idle and health based recycling
//! - **Recovery** keyed by a failure taxonomy, with orphan reaping
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use office_pdf_core::{Converter, ConverterConfig, ConversionRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let converter = Converter::new(ConverterConfig::default()).await?;
//!
//!     let result = converter
//!         .convert(ConversionRequest::new("report.docx", "report.pdf"))
//!         .await;
//!
//!     match result.report() {
//!         None => println!("Wrote {:?}", result.output_path),
//!         Some(report) => println!("{}: {}", report.title, report.recovery_guidance),
//!     }
//!     converter.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Batch Processing with Progress
//!
//! ```rust,no_run
//! use office_pdf_core::{Converter, ConverterConfig, ConversionRequest, ConversionProgress};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let converter = Converter::new(ConverterConfig::default()).await?;
//!
//!     let requests = vec![
//!         ConversionRequest::beside_input("doc1.docx"),
//!         ConversionRequest::beside_input("sheet.xlsx"),
//!     ];
//!
//!     let result = converter
//!         .convert_batch_with_progress(requests, |progress: ConversionProgress| {
//!             println!(
//!                 "File {}/{}: {:?}",
//!                 progress.file_index + 1,
//!                 progress.total_files,
//!                 progress.stage
//!             );
//!         })
//!         .await;
//!
//!     println!("{} converted in {:?}", result.successful.len(), result.total_duration);
//!     println!("{:?}", converter.statistics());
//!     Ok(())
//! }
//! ```

pub mod apartment;
pub mod config;
pub mod converter;
pub mod error;
pub mod host;
pub mod ledger;
pub mod pool;
pub mod process;
pub mod reaper;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod validation;
pub mod worker;

// Re-export main types for convenience
pub use apartment::ApartmentGuard;
pub use config::{
    BatchResult, ConversionMode, ConversionProgress, ConversionRequest, ConversionResult,
    ConversionStage, ConverterConfig, HostConfig, PoolConfig, ReaperConfig, RecoveryConfig,
    Statistics, ValidationConfig,
};
pub use converter::{Converter, ConverterBuilder};
pub use error::{
    ConversionError, ErrorReport, Failure, FailureCategory, HostError, InterfaceCode, Result,
    ValidationFailure,
};
pub use host::{AutomationHost, HostFactory, HostKind, HostObject, ObjectType};
pub use ledger::{ResourceLedger, ResourceScope};
pub use pool::{ConverterPool, HostServices};
pub use process::{ProcessTable, SystemProcessTable};
pub use reaper::ProcessReaper;
pub use recovery::{RecoveryDispatcher, RecoveryOutcome, RecoveryStrategy};
pub use registry::{OwnershipRegistry, ProcessOrigin};
pub use session::SessionState;
pub use worker::HostWorker;

/// Supported Office file extensions.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "docx", "doc", "docm", "dot", "dotx", "rtf", "odt", "xlsx", "xls", "xlsm", "xlsb", "csv",
    "ods",
];

/// Check if a file extension is supported.
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|&e| e.eq_ignore_ascii_case(ext))
}

/// Initialize the library's logging.
/// Call this once at application startup if you want to see logs.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
