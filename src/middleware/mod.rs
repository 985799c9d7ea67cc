//! 中间件模块
//!
//! 宿主程序在请求进入 agent 之前调用的安全中间件（SecurityMiddleware）

pub mod security_middleware;

pub use security_middleware::SecurityMiddleware;
