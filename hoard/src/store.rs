//! Persistent state of the proxy.
//!
//! Two stores cooperate per cached path: the [blob] store holds the actual
//! bytes, addressed by the SHA-256 of their content and shared by all targets,
//! while each target's [meta] store binds its URL paths to the current blob
//! hash and the origin headers needed to serve and revalidate it.
//!
//! The stores support parallel access from many request threads; the
//! consistency rule between them is that a meta entry naming blob `H` for path
//! `P` implies blob `H` exists and carries the pointer `<target>@<P>`.

pub mod blob;
pub mod meta;
