//! Command line configuration of the dispatcher.

use crate::dispatcher::DispatchError;
use crate::producer::BrokerConfig;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NAMESRV: &str = "127.0.0.1:9876";
pub const DEFAULT_TOPIC: &str = "test-topic";

/// Publishes a single message, or every line of a file, to a broker topic.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct DispatchConfig {
    /// Name-server address, for example: -n 127.0.0.1:9876.
    /// Several addresses may be separated by `;` or `,`
    #[arg(short = 'n', long = "namesrv", default_value = DEFAULT_NAMESRV)]
    pub namesrv: String,

    /// Topic to publish onto, for example: -t test-topic
    #[arg(short, long, default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Message file, one message per line, for example: -f /home/work/message.txt
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Single message, for example: -m "{\"userId\":123}"
    #[arg(short, long)]
    pub message: Option<String>,

    /// How long a single send waits for the broker acknowledgment
    #[arg(long, default_value_t = 3000)]
    pub send_timeout_ms: u64,

    /// Extra producer property, `key=value`. May be repeated
    #[arg(short = 'X', long = "producer-property", value_parser = parse_property)]
    pub producer_properties: Vec<(String, String)>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

/// Where the message bodies come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    File(PathBuf),
    Inline(String),
}

impl DispatchConfig {
    /// Picks the message source. A file takes precedence over an
    /// inline message; empty values count as absent.
    pub fn source(&self) -> Result<MessageSource, DispatchError> {
        let file = self
            .file
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty());
        let message = self.message.as_ref().filter(|body| !body.is_empty());

        match (file, message) {
            (Some(path), _) => Ok(MessageSource::File(path.clone())),
            (None, Some(body)) => Ok(MessageSource::Inline(body.clone())),
            (None, None) => Err(DispatchError::MissingSource),
        }
    }

    pub fn namesrv_addrs(&self) -> Result<Vec<String>, DispatchError> {
        let addrs: Vec<String> = self
            .namesrv
            .split([';', ','])
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();
        if addrs.is_empty() {
            return Err(DispatchError::InvalidNameServer(self.namesrv.clone()));
        }
        Ok(addrs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn broker_config(&self) -> Result<BrokerConfig, DispatchError> {
        let overrides = if self.producer_properties.is_empty() {
            None
        } else {
            Some(
                self.producer_properties
                    .iter()
                    .cloned()
                    .collect::<HashMap<String, String>>(),
            )
        };
        let addrs = self.namesrv_addrs()?;
        Ok(BrokerConfig::new_producer_config(addrs.as_slice(), overrides))
    }
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchConfig, MessageSource};
    use crate::dispatcher::DispatchError;
    use clap::Parser;
    use std::path::PathBuf;

    fn parse(args: &[&str]) -> DispatchConfig {
        DispatchConfig::try_parse_from(std::iter::once("mq-dispatch").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.namesrv, "127.0.0.1:9876");
        assert_eq!(config.topic, "test-topic");
        assert_eq!(config.file, None);
        assert_eq!(config.message, None);
        assert_eq!(config.send_timeout_ms, 3000);
        assert!(matches!(config.source(), Err(DispatchError::MissingSource)));
    }

    #[test]
    fn test_short_flags() {
        let config = parse(&[
            "-n",
            "10.0.0.1:9876",
            "-t",
            "orders",
            "-m",
            "{\"userId\":123}",
        ]);
        assert_eq!(config.namesrv, "10.0.0.1:9876");
        assert_eq!(config.topic, "orders");
        assert_eq!(
            config.source().unwrap(),
            MessageSource::Inline("{\"userId\":123}".to_string())
        );
    }

    #[test]
    fn test_file_wins_over_message() {
        let config = parse(&["-f", "/home/work/message.txt", "-m", "ignored"]);
        assert_eq!(
            config.source().unwrap(),
            MessageSource::File(PathBuf::from("/home/work/message.txt"))
        );
    }

    #[test]
    fn test_empty_values_are_absent() {
        let mut config = parse(&[]);
        config.file = Some(PathBuf::new());
        config.message = Some(String::new());
        assert!(matches!(config.source(), Err(DispatchError::MissingSource)));

        config.message = Some("hello".to_string());
        assert_eq!(
            config.source().unwrap(),
            MessageSource::Inline("hello".to_string())
        );
    }

    #[test]
    fn test_namesrv_list() {
        let config = parse(&["-n", "a:9876; b:9876,,c:9876 "]);
        assert_eq!(
            config.namesrv_addrs().unwrap(),
            vec!["a:9876", "b:9876", "c:9876"]
        );

        let config = parse(&["-n", " ; "]);
        assert!(matches!(
            config.namesrv_addrs(),
            Err(DispatchError::InvalidNameServer(_))
        ));
    }

    #[test]
    fn test_producer_properties() {
        let config = parse(&[
            "-X",
            "linger.ms=5",
            "--producer-property",
            "client.id=dispatch",
            "--send-timeout-ms",
            "250",
        ]);
        let broker = config.broker_config().unwrap();
        assert_eq!(broker.get("linger.ms"), Some("5"));
        assert_eq!(broker.get("client.id"), Some("dispatch"));
        assert_eq!(broker.get("bootstrap.servers"), Some("127.0.0.1:9876"));
        assert_eq!(config.send_timeout().as_millis(), 250);
    }

    #[test]
    fn test_malformed_property_rejected() {
        let res = DispatchConfig::try_parse_from(["mq-dispatch", "-X", "novalue"]);
        assert!(res.is_err());
        let res = DispatchConfig::try_parse_from(["mq-dispatch", "-X", "=value"]);
        assert!(res.is_err());
    }
}
