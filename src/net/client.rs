use color_eyre::{eyre::eyre, Result};
use std::future::Future;

use super::types::{Method, Request, Response};

/// Something that can turn a request into a response over the network.
///
/// A transport failure is an `Err`. A response with a non-success status is
/// still `Ok`; callers decide what a 404 or 500 means to them.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Network fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(user_agent: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

/// Header name/value pairs in wire order. Non-ASCII values are kept lossily.
fn header_pairs(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request, e))?;

    let status = response.status();
    let headers = header_pairs(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};

  #[test]
  fn test_header_pairs_keep_non_ascii_values() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(
      CONTENT_DISPOSITION,
      HeaderValue::from_bytes(b"inline; filename=caf\xe9.html").unwrap(),
    );

    let pairs = header_pairs(&headers);

    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&("content-type".to_string(), "text/html".to_string())));
    let disposition = pairs
      .iter()
      .find(|(name, _)| name == "content-disposition")
      .map(|(_, value)| value.as_str());
    assert_eq!(disposition, Some("inline; filename=caf\u{FFFD}.html"));
  }
}
