//! Network seam: request/response types and the fetchers that move them.

mod client;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Method, Request, Response};

#[cfg(test)]
pub use client::stub;
