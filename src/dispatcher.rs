use crate::config::MessageSource;
use crate::lines::MessageLines;
use crate::producer::{BrokerConfig, ClientError, KafkaProducer, Producer};
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

/// Errors that end a dispatch run with a failure exit status.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Neither a message file nor an inline message was given.
    #[error("message or message file is not exist")]
    MissingSource,

    #[error("no usable name-server address in `{0}`")]
    InvalidNameServer(String),

    #[error("failed to open message file {path}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start producer")]
    Start(#[source] ClientError),
}

/// Outcome of a run. Individual send failures end up here rather
/// than in a `DispatchError`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Publishes message bodies onto a single topic, one synchronous
/// send at a time.
///
/// The Dispatcher owns its `Producer` for the whole run: `run` starts
/// it, sends everything its message source holds and shuts it down
/// again. Send failures are logged and counted, never retried here.
/// Retrying is left to the producer configuration.
pub struct Dispatcher<'a> {
    producer: Box<dyn Producer + 'a>,
    topic: String,
    summary: DispatchSummary,
}

impl<'a> Dispatcher<'a> {
    /// Builds a Dispatcher publishing through rdkafka.
    pub fn new(
        broker_config: BrokerConfig,
        topic: &str,
        send_timeout: Duration,
    ) -> Dispatcher<'a> {
        Dispatcher::new_with_producer(
            Box::new(KafkaProducer::new(broker_config, send_timeout)),
            topic,
        )
    }

    /// Leaves the responsibility to provide a producer to the caller.
    pub fn new_with_producer(producer: Box<dyn Producer + 'a>, topic: &str) -> Dispatcher<'a> {
        Dispatcher {
            producer,
            topic: topic.to_string(),
            summary: DispatchSummary::default(),
        }
    }

    pub fn summary(&self) -> &DispatchSummary {
        &self.summary
    }

    /// Runs a whole dispatch: starts the producer, sends everything
    /// `source` holds and shuts the producer down.
    ///
    /// Once the producer started, shutdown is attempted exactly once,
    /// whatever happens while sending.
    pub fn run(&mut self, source: MessageSource) -> Result<DispatchSummary, DispatchError> {
        self.producer.start().map_err(DispatchError::Start)?;

        let res = match source {
            MessageSource::File(path) => self.send_file(path),
            MessageSource::Inline(body) => {
                self.send_one(&body);
                Ok(())
            }
        };

        if let Err(e) = self.producer.shutdown() {
            event!(Level::ERROR, error = %e, "shutdown producer");
        }

        res.map(|()| self.summary.clone())
    }

    fn send_file(&mut self, path: PathBuf) -> Result<(), DispatchError> {
        let lines = match MessageLines::open(&path) {
            Ok(lines) => lines,
            Err(source) => {
                event!(Level::ERROR, path = %path.display(), error = %source, "open file error");
                return Err(DispatchError::OpenFile { path, source });
            }
        };
        self.send_lines(lines);
        Ok(())
    }

    /// Sends every line produced by `lines`. A read error stops the
    /// iteration but is not fatal: what was read so far has been sent.
    pub fn send_lines<R: BufRead>(&mut self, lines: MessageLines<R>) {
        for line in lines {
            match line {
                Ok(body) => self.send_one(&body),
                Err(e) => {
                    event!(Level::ERROR, error = %e, "read message file failed");
                    break;
                }
            }
        }
    }

    /// Publishes one body, logs the outcome and records it in the
    /// summary.
    pub fn send_one(&mut self, body: &str) {
        self.summary.attempted += 1;
        match self.producer.send(self.topic.as_str(), body.as_bytes()) {
            Ok(receipt) => {
                self.summary.succeeded += 1;
                event!(
                    Level::INFO,
                    result = %receipt,
                    body = body,
                    "send message success"
                );
            }
            Err(e) => {
                self.summary.failed += 1;
                event!(
                    Level::ERROR,
                    error = %e,
                    body = body,
                    "send message failed"
                );
            }
        }
    }
}
