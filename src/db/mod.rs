//! Database access layer.
//!
//! - `connector`: opens, probes and cancels physical connections
//! - `pool`: bounded connection pool handing out scoped leases
//! - `executor`: runs one bound statement under a deadline
//! - `transaction`: transactions pinned to one leased connection
//! - `schema`: catalog introspection
//! - `params` / `types`: binding and value normalization

pub mod connector;
pub mod executor;
pub mod params;
pub mod pool;
pub mod schema;
pub mod transaction;
pub mod types;

pub use connector::{Connector, DbConnection, DbConnector};
pub use executor::{ExecutorSettings, StatementExecutor};
pub use pool::{ConnectionPool, DbLease, DbPool, Lease, PoolSettings, PoolStatus};
pub use schema::SchemaInspector;
pub use transaction::{TransactionCoordinator, TransactionHandle};
