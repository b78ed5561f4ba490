//! 业务服务层

pub mod case_service;
pub mod detection_service;
pub mod export_service;
pub mod ledger_service;
pub mod session_service;

pub use case_service::CaseService;
pub use detection_service::DetectionService;
pub use export_service::{ExportFormat, ExportService};
pub use ledger_service::{LedgerService, TrustAction};
pub use session_service::SessionService;
