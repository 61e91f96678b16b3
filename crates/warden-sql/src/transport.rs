use std::future::Future;

use serde_json::Value;
use warden_core::{BrokerError, Secret};

/// One result row as column name to JSON value, in column order.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone)]
pub struct QueryTarget {
    pub profile: String,
    pub connection_string: Secret,
}

/// Materialized rows plus the server-reported total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRows {
    pub rows: Vec<Row>,
    pub total: u64,
}

pub trait QueryConnector: Send + Sync {
    type Connection: QueryConnection;

    fn connect(
        &self,
        target: &QueryTarget,
    ) -> impl Future<Output = Result<Self::Connection, BrokerError>> + Send;
}

/// A single connection used for exactly one query.
pub trait QueryConnection: Send {
    fn set_statement_timeout(
        &mut self,
        timeout_ms: u64,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Run `query` with `params` bound positionally. At most `row_limit` rows
    /// are materialized; `total` counts every row the server produced.
    fn fetch(
        &mut self,
        query: &str,
        params: &[Value],
        row_limit: usize,
    ) -> impl Future<Output = Result<FetchedRows, BrokerError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;

    fn abort(self);
}
