//! Binary entry point for `hotwire`.
//!
//! The runtime lives in `hotwire::server`, so this binary only delegates to
//! the shared library code.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> { hotwire::server::run().await }
