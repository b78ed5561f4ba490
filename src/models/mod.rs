//! 数据模型模块
//! 事件账本记录、派生异常信号与调查案件

pub mod case;
pub mod finding;
pub mod ledger;
