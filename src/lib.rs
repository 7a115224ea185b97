pub mod classifier;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod rate_limit;
pub mod server;
pub mod translate;

pub use classifier::{CannedResponse, Classifier, Rule};
pub use config::GatewayConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use rate_limit::RateLimiter;
pub use server::{build_router, AppState};
