//! The fetch/cache coordination engine.
//!
//! A [Worker] routes request paths by longest prefix to their [Target]; a
//! target decides per path between serving the local blob, refreshing it from
//! one of its upstream origins, or passing the response through untouched,
//! while guaranteeing that concurrent requests for the same missing path
//! collapse into a single origin fetch.

pub mod response;
pub mod rule;
pub mod target;
pub mod upstream;
pub mod worker;

pub use response::{Body, ResponseWrapper};
pub use rule::RuleError;
pub use target::{Target, TargetConfig};
pub use upstream::Transport;
pub use worker::Worker;

use thiserror::Error;

/// Errors surfaced by the proxy layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The upstream request itself failed (connect, TLS, read).
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The upstream answered outside the 2xx range while errors were not
    /// being passed through.
    #[error("upstream {url} returned status {status}")]
    UpstreamStatus { url: String, status: u16 },

    /// The target has no upstream URLs to try.
    #[error("no upstream configured")]
    NoUpstream,

    #[error("target {0} is already bound")]
    DuplicateTarget(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}
