//! `hoard` is a caching reverse proxy for static, immutable-ish assets such as
//! package mirrors, release archives and container layers.
//!
//! You are reading the library API documentation. To run the proxy itself you
//! probably want the `hoard-server` binary, which puts an HTTP frontend on top
//! of this crate.
//!
//! `hoard` is built from three main concepts:
//!
//! - **Store**: the [store] module holds the persistent state — a
//!   content-addressed [blob store](store::blob) keyed by SHA-256 with
//!   reference-counted garbage collection, and a per-path
//!   [meta store](store::meta) binding URL paths to their cached blob and
//!   origin metadata.
//! - **Proxy**: the [proxy] module decides, per request path, whether to serve
//!   from the store, refresh from an upstream origin, or pass the response
//!   through untouched, and guarantees that concurrent requests for the same
//!   missing path collapse into a single origin fetch.
//! - **Worker**: a [proxy::Worker] owns the shared blob store, routes request
//!   paths to their [proxy::Target] by longest prefix, and drives the
//!   garbage-collection sweeps.

pub mod proxy;
pub mod store;

pub mod util {
    //! Collects locking, parsing and stream helpers that are not directly tied
    //! to the main concepts of `hoard`.

    pub(crate) mod clock;
    pub mod duration;
    pub(crate) mod httpdate;
    pub mod lock_group;
    pub mod replace;
    pub(crate) mod wait_group;
}

pub mod test_util {
    //! Utilities for testing `hoard` code.
    //!
    //! These are not intended to be used in production code.

    pub mod upstream;
}
