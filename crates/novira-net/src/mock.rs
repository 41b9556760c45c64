//! Scripted in-memory fetcher.
//!
//! Answers from a table of canned responses, counts calls per URL and can be
//! switched offline. Router and page tests drive everything through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderName, HeaderValue, StatusCode};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Scripted {
    Respond {
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
        body: Bytes,
    },
    Fail(String),
}

/// In-memory [`Fetcher`].
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<Request>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.script(
            url,
            Scripted::Respond {
                status,
                headers: Vec::new(),
                body: body.into(),
            },
        )
    }

    /// Answer `url` with a 200 carrying a header.
    pub fn respond_with_header(
        &self,
        url: &str,
        name: &'static str,
        value: &'static str,
        body: impl Into<Bytes>,
    ) -> &Self {
        self.script(
            url,
            Scripted::Respond {
                status: StatusCode::OK,
                headers: vec![(
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )],
                body: body.into(),
            },
        )
    }

    /// Fail every request to `url`.
    pub fn fail(&self, url: &str, reason: &str) -> &Self {
        self.script(url, Scripted::Fail(reason.to_string()))
    }

    /// Fail every request while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every answer.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Number of requests seen for `url`.
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|r| r.url.as_str() == url).count())
            .unwrap_or(0)
    }

    /// Number of requests seen overall.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    fn script(&self, url: &str, scripted: Scripted) -> &Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(url.to_string(), scripted);
        }
        self
    }

    fn answer(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        let scripted = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(request.url.as_str()).cloned());
        match scripted {
            Some(Scripted::Respond {
                status,
                headers,
                body,
            }) => {
                let mut response = Response::new(request.url.clone(), status, body);
                for (name, value) in headers {
                    response.headers.insert(name, value);
                }
                Ok(response)
            }
            Some(Scripted::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                Bytes::new(),
            )),
        }
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            trace!(url = %request.url, "Mock fetch");
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request.clone());
            }
            let latency = self.latency.lock().ok().and_then(|guard| *guard);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.answer(&request)
        })
    }
}
