//! Relational query execution: statement safety, bounded rows, server-side and
//! client-side timeouts, cancellation.

pub mod executor;
pub mod postgres;
pub mod transport;

pub use executor::{QueryExecutor, QueryOptions, QueryOutput, QueryRequest};
pub use postgres::PgConnector;
pub use transport::{FetchedRows, QueryConnection, QueryConnector, QueryTarget, Row};
