//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log targets used by the crate so subscribers can filter
//! cache, process, and server events independently of application logs.

/// Target used by binary cache preparation events.
pub(crate) const CACHE_TARGET: &str = "pg_embed::cache";

/// Target used by child process execution and output forwarding.
pub(crate) const PROCESS_TARGET: &str = "pg_embed::process";

/// Target used by server lifecycle spans and events.
pub(crate) const SERVER_TARGET: &str = "pg_embed::server";
