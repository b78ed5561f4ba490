//! 数据访问层

pub mod case_repo;
pub mod ledger_repo;
pub mod session_repo;

pub use case_repo::*;
pub use ledger_repo::*;
pub use session_repo::*;
