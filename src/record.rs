use crate::errors::Result;
use crate::{Request, Response};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One observed request/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRecord {
  /// The request as the client sent it
  pub request: Request,
  /// The response as upstream returned it
  pub response: Response,
}

impl HttpRecord {
  /// Pair a request with its response
  pub fn new(request: Request, response: Response) -> Self {
    HttpRecord { request, response }
  }

  /// Absolute URL of the request
  pub fn url(&self) -> String {
    self.request.url()
  }
}

/// Receives every successfully parsed exchange.
///
/// Calls happen on the connection's own task and are awaited before the
/// response is forwarded, so a slow observer only slows its own connection.
///
/// Any `Fn(Request, Response) -> impl Future<Output = ()>` closure is an
/// observer.
#[async_trait::async_trait]
pub trait Observer: Send + Sync {
  /// Called once per observed exchange
  async fn on_request_response(&self, request: Request, response: Response);
}

#[async_trait::async_trait]
impl<F, Fut> Observer for F
where
  F: Fn(Request, Response) -> Fut + Send + Sync,
  Fut: Future<Output = ()> + Send + 'static,
{
  async fn on_request_response(&self, request: Request, response: Response) {
    (self)(request, response).await
  }
}

/// Persistent sink for observed exchanges, e.g. a scan database
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
  /// Persist one exchange
  async fn save_request_response(&self, request: &Request, response: &Response) -> Result<()>;
  /// Most recent exchanges first, at most `limit` when given
  async fn get_history(&self, limit: Option<usize>) -> Result<Vec<HttpRecord>>;
}

/// In-memory history plus the optional storage and observers.
pub(crate) struct Recorder {
  history: Mutex<Vec<HttpRecord>>,
  storage: Option<Arc<dyn Storage>>,
  observers: Vec<Arc<dyn Observer>>,
}

impl Recorder {
  pub(crate) fn new(storage: Option<Arc<dyn Storage>>, observers: Vec<Arc<dyn Observer>>) -> Self {
    Recorder {
      history: Mutex::new(Vec::new()),
      storage,
      observers,
    }
  }

  /// Append to history, persist, then notify observers.
  ///
  /// Storage failures are logged and otherwise ignored.
  pub(crate) async fn record(&self, request: Request, response: Response) {
    self
      .history
      .lock()
      .await
      .push(HttpRecord::new(request.clone(), response.clone()));
    if let Some(storage) = &self.storage {
      if let Err(e) = storage.save_request_response(&request, &response).await {
        tracing::warn!(url = %request.url(), "storage failed: {}", e);
      }
    }
    for observer in &self.observers {
      observer
        .on_request_response(request.clone(), response.clone())
        .await;
    }
  }

  /// Snapshot copy of the history
  pub(crate) async fn history(&self) -> Vec<HttpRecord> {
    self.history.lock().await.clone()
  }

  pub(crate) async fn clear(&self) {
    self.history.lock().await.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;
  use crate::Method;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct MemoryStorage {
    saved: Mutex<Vec<HttpRecord>>,
  }

  #[async_trait::async_trait]
  impl Storage for MemoryStorage {
    async fn save_request_response(&self, request: &Request, response: &Response) -> Result<()> {
      self
        .saved
        .lock()
        .await
        .push(HttpRecord::new(request.clone(), response.clone()));
      Ok(())
    }

    async fn get_history(&self, limit: Option<usize>) -> Result<Vec<HttpRecord>> {
      let saved = self.saved.lock().await;
      let limit = limit.unwrap_or(saved.len());
      Ok(saved.iter().rev().take(limit).cloned().collect())
    }
  }

  struct BrokenStorage;

  #[async_trait::async_trait]
  impl Storage for BrokenStorage {
    async fn save_request_response(&self, _: &Request, _: &Response) -> Result<()> {
      Err(Error::IO(std::io::Error::other("disk full")))
    }

    async fn get_history(&self, _: Option<usize>) -> Result<Vec<HttpRecord>> {
      Ok(Vec::new())
    }
  }

  fn exchange(path: &str) -> (Request, Response) {
    (
      Request::new(Method::Get, path).header("Host", "example.com"),
      Response::new(200).unwrap(),
    )
  }

  #[tokio::test]
  async fn records_history_storage_and_observers() {
    let storage = Arc::new(MemoryStorage::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let observer = move |_request: Request, _response: Response| {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    };
    let observer: Arc<dyn Observer> = Arc::new(observer);
    let recorder = Recorder::new(Some(storage.clone()), vec![observer]);
    let (request, response) = exchange("/a");
    recorder.record(request, response).await;
    let (request, response) = exchange("/b");
    recorder.record(request, response).await;

    let history = recorder.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].url(), "http://example.com/a");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let latest = storage.get_history(Some(1)).await.unwrap();
    assert_eq!(latest[0].url(), "http://example.com/b");

    recorder.clear().await;
    assert!(recorder.history().await.is_empty());
  }

  #[tokio::test]
  async fn storage_errors_do_not_lose_history() {
    let recorder = Recorder::new(Some(Arc::new(BrokenStorage)), Vec::new());
    let (request, response) = exchange("/");
    recorder.record(request, response).await;
    assert_eq!(recorder.history().await.len(), 1);
  }

  #[test]
  fn records_serialize() {
    let (request, response) = exchange("/json");
    let record = HttpRecord::new(request, response);
    let json = serde_json::to_string(&record).unwrap();
    let back: HttpRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
  }
}
