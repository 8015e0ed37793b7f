use crate::chunker::IntervalChunker;
use crate::config::IngestConfig;
use crate::coverage::CoverageTracker;
use crate::limiter::RateLimiter;
use crate::normalize::Normalizer;
use crate::providers::{MarketDataSource, RawCandle, SessionHandle};
use crate::report::{IngestReport, KeyReport, WindowOutcome, WindowStatus};
use crate::retry::RetryPolicy;
use crate::storage::CandleStore;
use crate::writer::MarketDataWriter;
use chrono::Utc;
use chrono_tz::Tz;
use ck_types::{
    internal_error, CkError, CkResult, FetchWindow, Granularity, Instrument, SeriesKey, SourceError,
    TimeRange,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one run should fetch
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub instruments: Vec<Instrument>,
    pub granularity: Granularity,
    pub range: TimeRange,
    /// Refetch the whole range even where data is already stored.
    pub force: bool,
}

/// Drives a run: plans missing ranges per series, fetches windows through the
/// shared limiter and session, and hands normalized batches to the writer.
///
/// Series run concurrently up to `workers`; windows of one series run in order.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn CandleStore>,
    limiter: Arc<RateLimiter>,
    coverage: CoverageTracker,
    chunker: IntervalChunker,
    retry: RetryPolicy,
    writer: MarketDataWriter,
    normalizer: Normalizer,
    tz: Tz,
    workers: usize,
}

impl FetchOrchestrator {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn CandleStore>,
        config: &IngestConfig,
    ) -> CkResult<Self> {
        let tz = config.tz()?;
        let retry = RetryPolicy::from(&config.retry);
        Ok(Self {
            limiter: Arc::new(RateLimiter::from_settings(&config.rate_limit)),
            coverage: CoverageTracker::new(store.clone(), tz),
            chunker: IntervalChunker::new(config.span_limits.clone()),
            writer: MarketDataWriter::new(store.clone(), retry.clone(), tz),
            normalizer: Normalizer::new(tz),
            workers: config.workers.max(1),
            retry,
            source,
            store,
            tz,
        })
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.writer = MarketDataWriter::new(self.store.clone(), retry.clone(), self.tz);
        self.retry = retry;
        self
    }

    pub fn coverage(&self) -> &CoverageTracker {
        &self.coverage
    }

    /// Run the request to completion or cancellation.
    ///
    /// Per-window failures are recorded in the report. An authentication
    /// failure aborts the whole run and is returned as the error.
    pub async fn run(
        &self,
        request: &IngestRequest,
        cancel: &CancellationToken,
    ) -> CkResult<IngestReport> {
        let mut report = IngestReport::new();
        let run_cancel = cancel.child_token();

        info!(
            run_id = %report.run_id,
            source = %self.source.name(),
            instruments = request.instruments.len(),
            granularity = %request.granularity,
            range = %request.range,
            force = request.force,
            "starting ingestion run"
        );

        let source = &self.source;
        let session = self
            .retry
            .run("authenticate", &run_cancel, |_| source.authenticate())
            .await?;
        let session = Arc::new(SessionHandle::new(session));

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for instrument in &request.instruments {
            let this = self.clone();
            let instrument = instrument.clone();
            let session = session.clone();
            let permits = permits.clone();
            let cancel = run_cancel.clone();
            let key = instrument.series_key(request.granularity);
            let range = request.range;
            let force = request.force;

            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let mut report = KeyReport::new(key, &instrument.name);
                        report.error = Some("worker pool closed".to_string());
                        return (report, None);
                    }
                };
                this.ingest_key(&instrument, key, range, force, &session, &cancel).await
            });
        }

        let mut fatal: Option<CkError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (key_report, key_error) = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    error!("ingestion task failed: {}", join_error);
                    run_cancel.cancel();
                    fatal.get_or_insert(internal_error!("ingestion task failed: {}", join_error));
                    continue;
                }
            };
            if let Some(e) = key_error {
                if fatal.is_none() {
                    error!(series = %key_report.key, "aborting run: {}", e);
                    run_cancel.cancel();
                    fatal = Some(e);
                }
            }
            report.keys.push(key_report);
        }
        report.keys.sort_by(|a, b| a.key.cmp(&b.key));

        let current = session.current().await;
        if let Err(e) = self.source.logout(&current).await {
            warn!("logout failed: {}", e);
        }
        report.finished_at = Utc::now();

        match fatal {
            Some(e) => {
                report.log_summary();
                Err(e)
            }
            None => Ok(report),
        }
    }

    /// Plan and fetch one series. The second element carries a fatal error
    /// that should stop the whole run.
    async fn ingest_key(
        &self,
        instrument: &Instrument,
        key: SeriesKey,
        range: TimeRange,
        force: bool,
        session: &SessionHandle,
        cancel: &CancellationToken,
    ) -> (KeyReport, Option<CkError>) {
        let mut report = KeyReport::new(key.clone(), &instrument.name);

        let planned = if force {
            if range.is_empty() {
                Vec::new()
            } else {
                vec![range]
            }
        } else {
            match self.coverage.missing_ranges(&key, &range).await {
                Ok(gaps) => gaps,
                Err(e) => {
                    warn!(series = %key, "coverage query failed: {}", e);
                    report.error = Some(e.to_string());
                    return (report, None);
                }
            }
        };
        report.planned = planned.clone();

        if planned.is_empty() {
            info!(series = %key, instrument = %instrument.name, "already covered");
            return (report, None);
        }

        let windows: Vec<FetchWindow> = planned
            .iter()
            .flat_map(|gap| self.chunker.split_gap(&key, gap))
            .collect();
        info!(
            series = %key,
            instrument = %instrument.name,
            gaps = planned.len(),
            windows = windows.len(),
            "fetching"
        );

        let mut windows = windows.into_iter();
        while let Some(window) = windows.next() {
            if cancel.is_cancelled() {
                report.outcomes.push(WindowOutcome::cancelled(window));
                continue;
            }
            match self.process_window(&window, session, cancel).await {
                Ok(status) => report.outcomes.push(WindowOutcome { window, status }),
                Err(CkError::Cancelled) => report.outcomes.push(WindowOutcome::cancelled(window)),
                Err(e) if e.is_fatal() => {
                    report.outcomes.push(WindowOutcome::failed(window, &e));
                    report.outcomes.extend(windows.by_ref().map(WindowOutcome::cancelled));
                    return (report, Some(e));
                }
                Err(e) => {
                    warn!(window = %window, kind = e.kind(), "window failed: {}", e);
                    report.outcomes.push(WindowOutcome::failed(window, &e));
                }
            }
        }
        (report, None)
    }

    async fn process_window(
        &self,
        window: &FetchWindow,
        session: &SessionHandle,
        cancel: &CancellationToken,
    ) -> CkResult<WindowStatus> {
        let raw = self.fetch(window, session, cancel).await?;
        let batch = self.normalizer.normalize(window, &raw);
        for (index, reason) in &batch.rejected {
            warn!(window = %window, index = *index, "skipping record: {}", reason);
        }
        let rejected = batch.rejected.len();

        if batch.candles.is_empty() {
            debug!(window = %window, "no candles returned");
            return Ok(WindowStatus::Empty { rejected });
        }

        let written = self.writer.write(batch.candles, cancel).await?;
        debug!(
            window = %window,
            rows = written.rows_written,
            summaries = written.summaries_written,
            "window written"
        );
        Ok(WindowStatus::Written {
            rows: written.rows_written,
            rejected,
            summaries: written.summaries_written,
        })
    }

    /// Fetch one window under the limiter and retry policy. An expired session
    /// is refreshed once, then the window is retried with the new token.
    async fn fetch(
        &self,
        window: &FetchWindow,
        session: &SessionHandle,
        cancel: &CancellationToken,
    ) -> CkResult<Vec<RawCandle>> {
        let label = format!("get_candles {}", window);
        let mut refreshed = false;
        loop {
            let current = session.current().await;
            let (source, limiter) = (&self.source, &self.limiter);
            let result = self
                .retry
                .run(&label, cancel, |_| {
                    let current = current.clone();
                    async move {
                        limiter.acquire(cancel).await?;
                        source.get_candles(&current, window).await
                    }
                })
                .await;

            match result {
                Err(CkError::Source(SourceError::SessionExpired { .. })) if !refreshed => {
                    refreshed = true;
                    self.retry
                        .run("reauthenticate", cancel, |_| {
                            session.refresh(source.as_ref(), &current)
                        })
                        .await
                        .map_err(|e| match e {
                            CkError::Cancelled | CkError::Source(SourceError::Auth { .. }) => e,
                            other => SourceError::Auth {
                                message: format!("re-authentication failed: {}", other),
                            }
                            .into(),
                        })?;
                }
                other => return other,
            }
        }
    }
}
