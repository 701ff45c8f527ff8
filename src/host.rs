//! Host runtime that drives a worker through its lifecycle and routes requests to it.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::net::{Fetcher, Request, Response};
use crate::worker::Lifecycle;

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Controlling sessions; requests are intercepted
  Activated,
  /// Setup or cleanup failed; the worker will never control anything
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Events delivered to the host loop
enum HostEvent {
  Install(oneshot::Sender<Result<()>>),
  Activate(oneshot::Sender<Result<()>>),
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
  },
  State(oneshot::Sender<WorkerState>),
}

/// Handle to a running host loop.
///
/// Lifecycle events are awaited to completion inside the loop, one at a time.
/// Fetches are handled concurrently, each in its own task.
#[derive(Clone)]
pub struct Host {
  tx: mpsc::UnboundedSender<HostEvent>,
}

impl Host {
  /// Spawn the host loop for a worker. `network` serves every request the
  /// worker does not handle.
  pub fn spawn<W, N>(worker: Arc<W>, network: Arc<N>) -> Self
  where
    W: Lifecycle + 'static,
    N: Fetcher + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(worker, network, rx));

    Self { tx }
  }

  /// Run setup. On success the worker is ready to activate.
  pub async fn install(&self) -> Result<()> {
    self.call(HostEvent::Install).await?
  }

  /// Run cleanup and take control of all sessions.
  pub async fn activate(&self) -> Result<()> {
    self.call(HostEvent::Activate).await?
  }

  /// Install, then activate straight away without waiting for sessions to close.
  pub async fn start(&self) -> Result<()> {
    self.install().await?;
    self.activate().await
  }

  /// Send a request through the host. Only an activated worker sees it.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    self
      .call(|reply| HostEvent::Fetch { request, reply })
      .await?
  }

  pub async fn state(&self) -> Result<WorkerState> {
    self.call(HostEvent::State).await
  }

  async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> HostEvent) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(event(reply))
      .map_err(|_| eyre!("Host loop has stopped"))?;

    rx.await.map_err(|_| eyre!("Host loop dropped the reply"))
  }
}

async fn run<W, N>(worker: Arc<W>, network: Arc<N>, mut rx: mpsc::UnboundedReceiver<HostEvent>)
where
  W: Lifecycle + 'static,
  N: Fetcher + 'static,
{
  let mut state = WorkerState::Parsed;

  while let Some(event) = rx.recv().await {
    match event {
      HostEvent::Install(reply) => {
        let result = if state != WorkerState::Parsed {
          Err(eyre!("Cannot install a worker that is {}", state))
        } else {
          state = WorkerState::Installing;
          match worker.on_setup().await {
            Ok(()) => {
              state = WorkerState::Installed;
              info!("Worker installed");
              Ok(())
            }
            Err(e) => {
              state = WorkerState::Redundant;
              warn!("Worker setup failed: {}", e);
              Err(e)
            }
          }
        };
        let _ = reply.send(result);
      }
      HostEvent::Activate(reply) => {
        let result = if state != WorkerState::Installed {
          Err(eyre!("Cannot activate a worker that is {}", state))
        } else {
          state = WorkerState::Activating;
          match worker.on_cleanup().await {
            Ok(()) => {
              state = WorkerState::Activated;
              info!("Worker activated and controlling sessions");
              Ok(())
            }
            Err(e) => {
              state = WorkerState::Redundant;
              warn!("Worker cleanup failed: {}", e);
              Err(e)
            }
          }
        };
        let _ = reply.send(result);
      }
      HostEvent::Fetch { request, reply } => {
        let intercept = state == WorkerState::Activated;
        let worker = Arc::clone(&worker);
        let network = Arc::clone(&network);

        tokio::spawn(async move {
          let response = dispatch(worker.as_ref(), network.as_ref(), request, intercept).await;
          let _ = reply.send(response);
        });
      }
      HostEvent::State(reply) => {
        let _ = reply.send(state);
      }
    }
  }

  debug!("Host loop finished");
}

async fn dispatch<W: Lifecycle, N: Fetcher>(
  worker: &W,
  network: &N,
  request: Request,
  intercept: bool,
) -> Result<Response> {
  if intercept {
    if let Some(response) = worker.on_request(request.clone()).await {
      return Ok(response);
    }
  }

  network.fetch(&request).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, MemoryStorage};
  use crate::net::stub::StubFetcher;
  use crate::net::Method;
  use crate::worker::{CacheLifecycleManager, WorkerSettings};
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("http://app.test").unwrap().join(path).unwrap()
  }

  fn settings(version: u32) -> WorkerSettings {
    WorkerSettings {
      prefix: "rapunzel".to_string(),
      version,
      manifest: vec![url("/"), url("/index.html")],
      navigation_fallback: url("/index.html"),
    }
  }

  fn stub() -> Arc<StubFetcher> {
    Arc::new(
      StubFetcher::new()
        .route("/", Response::new(200, "root"))
        .route("/index.html", Response::new(200, "shell"))
        .route("/submit", Response::new(201, "created")),
    )
  }

  fn host(storage: &Arc<MemoryStorage>, network: &Arc<StubFetcher>, version: u32) -> Host {
    let worker = Arc::new(CacheLifecycleManager::new(
      settings(version),
      Arc::clone(storage),
      Arc::clone(network),
    ));
    Host::spawn(worker, Arc::clone(network))
  }

  #[tokio::test]
  async fn test_start_activates_and_intercepts() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();
    let host = host(&storage, &network, 1);

    assert_eq!(host.state().await.unwrap(), WorkerState::Parsed);
    host.start().await.unwrap();
    assert_eq!(host.state().await.unwrap(), WorkerState::Activated);

    network.set_offline(true);
    let response = host.fetch(Request::get(url("/"))).await.unwrap();
    assert_eq!(response.body, b"root");

    let response = host.fetch(Request::get(url("/uncached.js"))).await.unwrap();
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_failed_setup_makes_worker_redundant() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();
    network.set_offline(true);
    let host = host(&storage, &network, 1);

    assert!(host.start().await.is_err());
    assert_eq!(host.state().await.unwrap(), WorkerState::Redundant);
    assert!(host.activate().await.is_err());

    // Requests are not intercepted, so the network error reaches the caller
    assert!(host.fetch(Request::get(url("/"))).await.is_err());
  }

  #[tokio::test]
  async fn test_requests_pass_through_until_activated() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();
    let host = host(&storage, &network, 1);

    host.install().await.unwrap();
    assert_eq!(host.state().await.unwrap(), WorkerState::Installed);

    network.set_offline(true);
    assert!(host.fetch(Request::get(url("/"))).await.is_err());

    host.activate().await.unwrap();
    assert!(host.fetch(Request::get(url("/"))).await.is_ok());
  }

  #[tokio::test]
  async fn test_non_get_goes_to_network() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();
    let host = host(&storage, &network, 1);
    host.start().await.unwrap();

    let request = Request::get(url("/submit")).with_method(Method::Post);
    let response = host.fetch(request).await.unwrap();

    assert_eq!(response.status, 201);
    assert!(storage
      .keys("rapunzel-v1")
      .unwrap()
      .iter()
      .all(|k| !k.url.ends_with("/submit")));
  }

  #[tokio::test]
  async fn test_new_version_rotates_buckets() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();

    host(&storage, &network, 1).start().await.unwrap();
    assert_eq!(storage.bucket_names().unwrap(), vec!["rapunzel-v1"]);

    host(&storage, &network, 2).start().await.unwrap();
    assert_eq!(storage.bucket_names().unwrap(), vec!["rapunzel-v2"]);
  }

  #[tokio::test]
  async fn test_install_twice_is_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let network = stub();
    let host = host(&storage, &network, 1);

    host.install().await.unwrap();
    assert!(host.install().await.is_err());
    assert_eq!(host.state().await.unwrap(), WorkerState::Installed);
  }
}
