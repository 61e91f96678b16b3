use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::{
    BrokerError, CancelToken, ConcurrencyLimiter, PolicyGate, ProfileStore, ProgressReporter,
    tighten,
};

use crate::transport::{FetchedRows, QueryConnection, QueryConnector, QueryTarget, Row};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Zero is treated as unset.
    pub timeout_ms: Option<u64>,
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub profile: String,
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, flatten)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(profile: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            query: query.into(),
            params: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    /// Rows the server produced, which may exceed `rows.len()`.
    pub row_count: u64,
    pub truncated: bool,
    pub duration_ms: u64,
}

/// Runs one parameterized statement per call against a database profile.
#[derive(Debug, Clone)]
pub struct QueryExecutor<C> {
    connector: C,
    profiles: ProfileStore,
    limiter: ConcurrencyLimiter,
}

impl<C: QueryConnector> QueryExecutor<C> {
    #[must_use]
    pub fn new(connector: C, profiles: ProfileStore) -> Self {
        Self {
            connector,
            profiles,
            limiter: ConcurrencyLimiter::new(),
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// # Errors
    ///
    /// Returns `NotFound`, `PolicyViolation`, `Timeout`, `Cancelled` or `Transport`.
    #[tracing::instrument(name = "query", skip_all, fields(profile = %request.profile))]
    pub async fn execute(
        &self,
        request: &QueryRequest,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> Result<QueryOutput, BrokerError> {
        let snapshot = self.profiles.load();
        let profile = snapshot.database(&request.profile)?;
        PolicyGate::check_query(&profile.allowed_statement_patterns, &request.query)?;

        let timeout_ms = tighten(
            request.options.timeout_ms.filter(|ms| *ms > 0),
            profile.max_execution_ms,
        );
        let row_limit = tighten(request.options.max_rows, profile.max_rows);
        let target = QueryTarget {
            profile: request.profile.clone(),
            connection_string: profile.connection_string.clone(),
        };

        progress.report(0.0, Some("waiting for capacity"));
        let mut slot = self
            .limiter
            .acquire(&request.profile, profile.max_concurrent, cancel)
            .await?;
        // A grant racing with cancellation must not start any work.
        if cancel.is_cancelled() {
            slot.release();
            return Err(BrokerError::cancelled_by(cancel));
        }

        let started = Instant::now();
        let mut conn: Option<C::Connection> = None;
        let outcome = {
            let work = self.drive(&target, request, timeout_ms, row_limit, &mut conn, progress);
            tokio::select! {
                biased;
                res = work => res,
                () = cancel.cancelled() => Err(BrokerError::cancelled_by(cancel)),
                () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    Err(BrokerError::Timeout { timeout_ms })
                }
            }
        }
        .map_err(|e| e.superseded_by(cancel));

        if let Some(conn) = conn.take() {
            if !matches!(
                outcome,
                Err(BrokerError::Timeout { .. } | BrokerError::Cancelled { .. })
            ) {
                conn.close().await;
            } else {
                conn.abort();
            }
        }
        slot.release();

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(fetched) => {
                let truncated = fetched.total > fetched.rows.len() as u64;
                tracing::info!(
                    rows = fetched.rows.len(),
                    row_count = fetched.total,
                    truncated,
                    duration_ms,
                    "query completed"
                );
                progress.report(1.0, Some("completed"));
                Ok(QueryOutput {
                    rows: fetched.rows,
                    row_count: fetched.total,
                    truncated,
                    duration_ms,
                })
            }
            Err(e @ (BrokerError::Timeout { .. } | BrokerError::Cancelled { .. })) => {
                tracing::warn!(duration_ms, "query aborted: {e}");
                Err(e)
            }
            Err(e) => {
                tracing::info!(duration_ms, "query failed: {e}");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        target: &QueryTarget,
        request: &QueryRequest,
        timeout_ms: u64,
        row_limit: usize,
        conn: &mut Option<C::Connection>,
        progress: &ProgressReporter,
    ) -> Result<FetchedRows, BrokerError> {
        progress.report(0.1, Some("connecting"));
        let conn = conn.insert(self.connector.connect(target).await?);
        conn.set_statement_timeout(timeout_ms).await?;

        progress.report(0.3, Some("executing query"));
        conn.fetch(&request.query, &request.params, row_limit).await
    }
}
