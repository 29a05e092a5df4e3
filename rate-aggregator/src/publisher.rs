#[cfg(test)]
use crossbeam_channel::Sender;
use std::io::Write;

/// Канал, куда уходят отформатированные котировки
pub(crate) trait Publisher: Send + Sync {
    fn publish(&self, message: &str) -> anyhow::Result<()>;
}

/// Печатает `topic: message` в stdout, по строке на котировку
#[derive(Debug, Clone)]
pub(crate) struct StdoutPublisher {
    topic: String,
}

impl StdoutPublisher {
    pub(crate) fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl Publisher for StdoutPublisher {
    fn publish(&self, message: &str) -> anyhow::Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}: {message}", self.topic)?;
        Ok(())
    }
}

/// Складывает сообщения в канал, чтобы тесты видели, что опубликовано
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct ChannelPublisher {
    tx: Sender<String>,
}

#[cfg(test)]
impl ChannelPublisher {
    pub(crate) fn new(tx: Sender<String>) -> Self {
        Self { tx }
    }
}

#[cfg(test)]
impl Publisher for ChannelPublisher {
    fn publish(&self, message: &str) -> anyhow::Result<()> {
        self.tx
            .send(message.to_string())
            .map_err(|_| anyhow::anyhow!("publish channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_publisher_forwards_and_reports_closed_channel() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let p = ChannelPublisher::new(tx);

        p.publish("PF1_USDTRY|35.00|36.00|t").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "PF1_USDTRY|35.00|36.00|t");

        drop(rx);
        assert!(p.publish("x").is_err());
    }

    #[test]
    fn stdout_publisher_writes() {
        StdoutPublisher::new("rates").publish("USDTRY|1.00|2.00|t").unwrap();
    }
}
