//! HTTP 处理器模块

pub mod case;
pub mod detection;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod session;
