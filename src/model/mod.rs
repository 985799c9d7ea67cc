//! 数据模型模块

pub mod lead;

pub use lead::{LeadRecord, SealedLead, CONTEXT_CONTACT, CONTEXT_NAME, CONTEXT_PROBLEM};
