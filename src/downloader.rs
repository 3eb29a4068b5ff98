use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use reqwest::{header, Client, Response, StatusCode};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::progress::{MeterUnit, ProgressReporter};
use crate::retry::{cancellable, retry_fixed, RetryPolicy};
use crate::store::{SessionHandle, SessionStore};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Fetches ordered segment lists and single resumable resources into a
/// [`SessionStore`], with bounded parallelism, per-unit retry and
/// cooperative cancellation.
pub struct Downloader {
    client: Client,
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    concurrency: usize,
    rate_limiter: Option<(Arc<Limiter>, NonZeroU32)>,
}

impl Downloader {
    pub fn new(client: Client, store: Arc<dyn SessionStore>, config: &EngineConfig) -> Self {
        let rate_limiter = config.rate_limit.and_then(NonZeroU32::new).map(|limit| {
            let quota = Quota::per_second(limit);
            (Arc::new(RateLimiter::direct(quota)), limit)
        });

        Self {
            client,
            store,
            retry: config.retry_policy(),
            concurrency: config.effective_concurrency().max(1),
            rate_limiter,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// GET a text document (manifests, playlists) with retry.
    pub async fn fetch_text(&self, url: &str, token: &CancellationToken) -> Result<String> {
        retry_fixed(&self.retry, token, "Playlist request", |attempt| async move {
            debug!(url, attempt, "Fetching text");
            cancellable(token, async {
                let response = self.get(url, None, "text fetch").await?;
                Ok(response.text().await?)
            })
            .await
        })
        .await
    }

    /// GET a small auxiliary resource (cover art). Failures are logged and
    /// turned into `None`.
    pub async fn fetch_optional(&self, url: &str, token: &CancellationToken) -> Option<Bytes> {
        let result = retry_fixed(&self.retry, token, "Optional request", |_| async move {
            cancellable(token, async {
                let response = self.get(url, None, "optional fetch").await?;
                Ok(response.bytes().await?)
            })
            .await
        })
        .await;

        match result {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(url, error = %e, "Skipping optional resource");
                None
            }
        }
    }

    /// Fetch every URL into the store under `session`, at most
    /// `concurrency` requests at a time, and return the bodies indexed like
    /// `urls`.
    ///
    /// Segments already present in the store are not requested again. Each
    /// window is awaited completely before the next one starts.
    pub async fn fetch_segments(
        &self,
        session: &SessionHandle,
        prefix: &str,
        urls: &[String],
        token: &CancellationToken,
        reporter: &ProgressReporter,
        label: &str,
    ) -> Result<Vec<Bytes>> {
        let total = urls.len();
        let mut results = vec![Bytes::new(); total];
        let mut meter = reporter.meter(label, MeterUnit::Segments, Some(total as u64));
        let mut done = 0u64;

        for (window, chunk) in urls.chunks(self.concurrency).enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let offset = window * self.concurrency;
            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    let index = offset + i;
                    async move {
                        let result = self.fetch_segment(session, prefix, index, url, token).await;
                        (index, result)
                    }
                })
                .collect();

            // An error drops the rest of the window with it.
            while let Some((index, result)) = in_flight.next().await {
                results[index] = result?;
                done += 1;
                meter.update(done);
            }
        }

        meter.finish(done);
        debug!(session = session.id(), total, "All segments fetched");
        Ok(results)
    }

    async fn fetch_segment(
        &self,
        session: &SessionHandle,
        prefix: &str,
        index: usize,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        let key = session.segment_key(prefix, index);
        if let Some(cached) = self.store.read_partial(&key).await? {
            if !cached.is_empty() {
                debug!(index, key = %key, "Segment already stored");
                return Ok(cached);
            }
        }

        let body = retry_fixed(&self.retry, token, "Segment download", |attempt| async move {
            debug!(index, attempt, url, "Fetching segment");
            cancellable(token, async {
                let response = self.get(url, None, "segment download").await?;
                let body = response.bytes().await?;
                self.throttle(body.len()).await;
                Ok(body)
            })
            .await
        })
        .await?;

        self.store.append(&key, &body).await?;
        Ok(body)
    }

    /// Fetch one large resource, resuming from whatever the store already
    /// holds for `name`.
    pub async fn fetch_resource(
        &self,
        session: &SessionHandle,
        name: &str,
        url: &str,
        token: &CancellationToken,
        reporter: &ProgressReporter,
        label: &str,
    ) -> Result<Bytes> {
        let key = session.resource_key(name);
        let key = key.as_str();
        let total = self.remote_length(url, token).await?;
        let mut stored = self
            .store
            .read_partial(key)
            .await?
            .map_or(0, |data| data.len() as u64);

        let mut meter = reporter.meter(label, MeterUnit::Bytes, total);
        match total {
            Some(total) if stored == total && total > 0 => {
                info!(key, bytes = total, "Resource already complete, nothing to transfer");
                meter.finish(total);
                return self.store.finalize(key).await;
            }
            Some(total) if stored > total => {
                warn!(key, stored, total, "Stored data is longer than the remote file, restarting");
                self.store.remove(key).await?;
                stored = 0;
            }
            _ => {}
        }
        if stored > 0 {
            info!(key, offset = stored, "Resuming download");
        } else {
            // Leftovers a store cannot offer back must not end up in front of the new body.
            self.store.remove(key).await?;
        }
        meter.resume_from(stored);

        let position = AtomicU64::new(stored);
        let meter = Mutex::new(meter);

        retry_fixed(&self.retry, token, "Resource download", |attempt| {
            let position = &position;
            let meter = &meter;
            async move {
                let from = position.load(Ordering::SeqCst);
                debug!(url, attempt, from, "Requesting resource");
                let response = cancellable(token, self.get(url, Some(from), "resource download")).await?;

                match response.status() {
                    StatusCode::RANGE_NOT_SATISFIABLE => return Ok(()),
                    StatusCode::PARTIAL_CONTENT => {}
                    _ if from > 0 => {
                        warn!(key, "Server ignored the range request, restarting from zero");
                        self.store.remove(key).await?;
                        position.store(0, Ordering::SeqCst);
                        meter.lock().resume_from(0);
                    }
                    _ => {}
                }

                let mut stream = response.bytes_stream();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(DownloadError::Cancelled),
                        next = stream.next() => next,
                    };
                    let Some(chunk) = next else { break };
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    cancellable(token, async {
                        self.throttle(chunk.len()).await;
                        Ok(())
                    })
                    .await?;

                    self.store.append(key, &chunk).await?;
                    let done = position.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
                    meter.lock().update(done);
                }
                Ok(())
            }
        })
        .await?;

        let done = position.load(Ordering::SeqCst);
        if let Some(total) = total {
            if done != total {
                warn!(key, done, total, "Resource length differs from Content-Length");
            }
        }
        meter.into_inner().finish(done);
        self.store.finalize(key).await
    }

    /// Content-Length from a HEAD request. Servers that refuse HEAD just
    /// leave the length unknown.
    async fn remote_length(&self, url: &str, token: &CancellationToken) -> Result<Option<u64>> {
        let result = cancellable(token, async {
            let response = self.client.head(url).send().await?;
            if !response.status().is_success() {
                return Err(DownloadError::http_status(response.status(), url, "HEAD"));
            }
            // `content_length()` reports the (empty) body of a HEAD response,
            // so read the header itself.
            Ok(response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok()))
        })
        .await;

        match result {
            Ok(length) => Ok(length),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(url, error = %e, "HEAD failed, total size unknown");
                Ok(None)
            }
        }
    }

    async fn get(&self, url: &str, from: Option<u64>, operation: &'static str) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(from) = from.filter(|f| *f > 0) {
            request = request.header(header::RANGE, format!("bytes={}-", from));
        }
        let response = request.send().await?;
        let status = response.status();
        let resumed = from.is_some_and(|f| f > 0);
        if status.is_success() || (status == StatusCode::RANGE_NOT_SATISFIABLE && resumed) {
            Ok(response)
        } else {
            Err(DownloadError::http_status(status, url, operation))
        }
    }

    async fn throttle(&self, len: usize) {
        let Some((limiter, burst)) = &self.rate_limiter else {
            return;
        };
        let mut remaining = len as u64;
        while remaining > 0 {
            let step = remaining.min(burst.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(step) {
                // `step` never exceeds the burst size, so this cannot fail.
                let _ = limiter.until_n_ready(n).await;
            }
            remaining -= step as u64;
        }
    }
}
