//! 认证模块
//! 外部身份层签发的 JWT 验证与调用方范围判定

pub mod jwt;
pub mod middleware;

pub use jwt::JwtService;
pub use middleware::AuthContext;
