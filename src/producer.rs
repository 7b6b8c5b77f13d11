//! This module provides an abstraction over the broker producer in
//! order to keep the dispatcher independent from the rdkafka client
//! it actually publishes with.
//!
//! The dispatcher only needs three operations: start, a synchronous
//! send and shutdown. Hiding them behind a trait also makes it easy
//! to replace the client with a recording double in unit tests.

use chrono::{DateTime, Local};
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::Producer as RdKafkaProducer;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, ProducerContext};
use rdkafka::ClientContext;
use serde::Serialize;
#[cfg(test)]
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
#[cfg(test)]
use std::rc::Rc;
use std::sync::mpsc::{self, SyncSender, TryRecvError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{event, Level};

/// Number of times the client retries a failed publish before
/// reporting the failure back to us.
pub const DEFAULT_SEND_RETRIES: u32 = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

const MESSAGE_TIMEOUT_KEY: &str = "message.timeout.ms";

/// librdkafka scans for expired messages about once a second, so the
/// delivery report for a timed out message can lag behind the timeout.
const DELIVERY_REPORT_GRACE: Duration = Duration::from_secs(5);

/// This structure wraps the parameters to initialize a producer.
/// It is there in order not to expose the rdkafka details outside.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    config_map: HashMap<String, String>,
}

impl BrokerConfig {
    /// Builds a producer config pointing at the given name-server
    /// addresses. The addresses are handed verbatim to the client,
    /// which takes care of discovering the rest of the cluster.
    pub fn new_producer_config<S: AsRef<str>>(
        namesrv_addrs: &[S],
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let bootstrap_servers = namesrv_addrs
            .iter()
            .map(|addr| addr.as_ref())
            .collect::<Vec<_>>()
            .join(",");

        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers);
        config_map.insert(
            "message.send.max.retries".to_string(),
            DEFAULT_SEND_RETRIES.to_string(),
        );

        let config = Self { config_map };

        apply_override_params(config, override_params)
    }

    /// Bounds how long the client keeps a message queued before it
    /// reports the delivery as failed. An explicit override wins.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.config_map
            .entry(MESSAGE_TIMEOUT_KEY.to_string())
            .or_insert_with(|| timeout.as_millis().to_string());
        self
    }

    /// `None` when the client may keep a message queued forever.
    fn message_timeout(&self) -> Option<Duration> {
        self.get(MESSAGE_TIMEOUT_KEY)?
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config_map.get(key).map(String::as_str)
    }
}

impl From<BrokerConfig> for RdKafkaConfig {
    fn from(item: BrokerConfig) -> Self {
        let mut config_obj = RdKafkaConfig::new();
        for (key, val) in item.config_map.iter() {
            config_obj.set(key, val);
        }
        config_obj
    }
}

fn apply_override_params<V>(
    mut config: BrokerConfig,
    override_params: Option<HashMap<String, V>>,
) -> BrokerConfig
where
    V: Into<String>,
{
    if let Some(params) = override_params {
        for (param, value) in params {
            config.config_map.insert(param, value.into());
        }
    }
    config
}

/// Acknowledgment returned by the broker for a single message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SendReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub acked_at: DateTime<Local>,
}

impl SendReceipt {
    pub fn new(topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            acked_at: Local::now(),
        }
    }
}

impl fmt::Display for SendReceipt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SendResult [topic={}, partition={}, offset={}]",
            self.topic, self.partition, self.offset
        )
    }
}

type DeliveryReply = SyncSender<Result<SendReceipt, ClientError>>;

/// Hands the outcome of each delivery back to the `send` call that
/// is waiting for it.
struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliveryReply>;

    fn delivery(&self, result: &DeliveryResult, reply: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(message) => {
                event!(Level::DEBUG, "Message produced.");
                Ok(SendReceipt::new(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                ))
            }
            Err((kafka_err, _)) => {
                event!(Level::DEBUG, "Message production failed. {}", kafka_err);
                Err(ClientError::SendFailed(kafka_err.clone()))
            }
        };
        // The waiting side may already have given up.
        let _ = reply.try_send(outcome);
    }
}

/// Producer errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to create the producer because of the invalid configuration.
    #[error("failed to create producer: invalid client config")]
    InvalidConfig(#[source] KafkaError),

    #[error("producer already started")]
    AlreadyStarted,

    #[error("producer not started")]
    NotStarted,

    /// The broker rejected the message or the client gave up on it.
    #[error("failed to send message")]
    SendFailed(#[source] KafkaError),

    /// No delivery report arrived in time.
    #[error("no delivery report after {0:?}")]
    DeliveryTimeout(Duration),

    #[error("failed to flush producer on shutdown")]
    ShutdownFailed(#[source] KafkaError),
}

/// The producer lifecycle the dispatcher relies on.
///
/// `send` is synchronous: it returns only once the broker acknowledged
/// the message or the attempt failed.
pub trait Producer {
    fn start(&mut self) -> Result<(), ClientError>;
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<SendReceipt, ClientError>;
    fn shutdown(&mut self) -> Result<(), ClientError>;
}

/// Publishes through an rdkafka `BaseProducer`.
///
/// The client's delivery report is the only source of truth for the
/// outcome of a send: the send timeout becomes `message.timeout.ms`,
/// so librdkafka itself gives up on the message and reports it. We
/// only stop waiting on our own if that report never shows up.
pub struct KafkaProducer {
    config: BrokerConfig,
    send_timeout: Duration,
    report_wait: Option<Duration>,
    producer: Option<BaseProducer<DeliveryContext>>,
}

impl KafkaProducer {
    /// Nothing is created until `start`, so building a `KafkaProducer`
    /// never fails.
    pub fn new(config: BrokerConfig, send_timeout: Duration) -> KafkaProducer {
        let config = config.with_message_timeout(send_timeout);
        let report_wait = config
            .message_timeout()
            .map(|timeout| timeout + DELIVERY_REPORT_GRACE);
        KafkaProducer {
            config,
            send_timeout,
            report_wait,
            producer: None,
        }
    }

    /// Messages handed to the client and not reported yet.
    pub fn in_flight_count(&self) -> i32 {
        self.producer
            .as_ref()
            .map_or(0, |producer| producer.in_flight_count())
    }

    fn wait_for_delivery(
        &self,
        producer: &BaseProducer<DeliveryContext>,
        reply: mpsc::Receiver<Result<SendReceipt, ClientError>>,
    ) -> Result<SendReceipt, ClientError> {
        let deadline = self.report_wait.map(|wait| Instant::now() + wait);
        loop {
            producer.poll(POLL_INTERVAL);
            match reply.try_recv() {
                Ok(outcome) => return outcome,
                Err(TryRecvError::Empty)
                    if deadline.map_or(true, |deadline| Instant::now() < deadline) =>
                {
                    continue
                }
                Err(_) => {
                    return Err(ClientError::DeliveryTimeout(
                        self.report_wait.unwrap_or(self.send_timeout),
                    ))
                }
            }
        }
    }
}

impl Producer for KafkaProducer {
    fn start(&mut self) -> Result<(), ClientError> {
        if self.producer.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let producer_config: RdKafkaConfig = self.config.clone().into();
        let producer = producer_config
            .create_with_context(DeliveryContext)
            .map_err(ClientError::InvalidConfig)?;
        self.producer = Some(producer);
        Ok(())
    }

    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<SendReceipt, ClientError> {
        let producer = self.producer.as_ref().ok_or(ClientError::NotStarted)?;

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let record: BaseRecord<'_, [u8], [u8], Box<DeliveryReply>> =
            BaseRecord::with_opaque_to(topic_name, Box::new(reply_tx)).payload(payload);
        producer
            .send(record)
            .map_err(|(error, _record)| ClientError::SendFailed(error))?;

        self.wait_for_delivery(producer, reply_rx)
    }

    fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.producer.take() {
            Some(producer) => producer
                .flush(self.send_timeout)
                .map_err(ClientError::ShutdownFailed),
            None => Ok(()),
        }
    }
}

/// One call observed by the `DummyProducer`.
#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Start,
    Send(String, Vec<u8>),
    Shutdown,
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct DummyProducer {
    pub calls: Rc<RefCell<Vec<Call>>>,
    pub fail_start: bool,
    pub fail_payloads: Vec<Vec<u8>>,
    pub fail_shutdown: bool,
}

#[cfg(test)]
impl DummyProducer {
    pub fn recording(calls: &Rc<RefCell<Vec<Call>>>) -> Self {
        DummyProducer {
            calls: Rc::clone(calls),
            ..Default::default()
        }
    }
}

#[cfg(test)]
impl Producer for DummyProducer {
    fn start(&mut self) -> Result<(), ClientError> {
        self.calls.borrow_mut().push(Call::Start);
        if self.fail_start {
            return Err(ClientError::InvalidConfig(KafkaError::ClientCreation(
                "dummy start failure".to_string(),
            )));
        }
        Ok(())
    }

    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<SendReceipt, ClientError> {
        let mut calls = self.calls.borrow_mut();
        calls.push(Call::Send(topic_name.to_string(), payload.to_vec()));
        if self.fail_payloads.iter().any(|p| p.as_slice() == payload) {
            return Err(ClientError::DeliveryTimeout(Duration::from_millis(1)));
        }
        let offset = calls.iter().filter(|c| matches!(c, Call::Send(..))).count() as i64 - 1;
        Ok(SendReceipt::new(topic_name, 0, offset))
    }

    fn shutdown(&mut self) -> Result<(), ClientError> {
        self.calls.borrow_mut().push(Call::Shutdown);
        if self.fail_shutdown {
            return Err(ClientError::ShutdownFailed(KafkaError::ClientCreation(
                "dummy shutdown failure".to_string(),
            )));
        }
        Ok(())
    }
}
