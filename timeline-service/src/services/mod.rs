pub mod banking;
pub mod batch;
pub mod fan_out;
pub mod ingestor;
pub mod metrics;
pub mod store;
pub mod timeline;

pub use banking::{AdatreeClient, BankingApi, BankingError};
pub use batch::BatchIdGenerator;
pub use ingestor::{BatchIngestor, IngestionReport};
pub use metrics::{get_metrics, init_metrics};
pub use store::{InMemoryStore, MongoConnector, StoreConnector, StoreError, StoreSession};
pub use timeline::TimelineReconstructor;
