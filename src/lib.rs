pub mod config;
pub mod dispatcher;
pub mod lines;
pub mod producer;

pub use config::{DispatchConfig, MessageSource};
pub use dispatcher::{DispatchError, DispatchSummary, Dispatcher};
pub use lines::MessageLines;
pub use producer::{BrokerConfig, ClientError, KafkaProducer, Producer, SendReceipt};
