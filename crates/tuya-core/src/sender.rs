//! Reliable datapoint writes with bounded retry

use crate::config::RetryPolicy;
use crate::error::SendError;
use std::sync::Arc;
use std::time::Duration;
use tuya_protocol::{codec, DataType, DatapointTransport, DatapointValue, Sequencer, TransportError};

/// One outbound datapoint write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointCommand {
    pub dp: u32,
    pub datatype: DataType,
    pub value: DatapointValue,
}

impl DatapointCommand {
    /// Command with the datatype inferred from the value
    #[must_use]
    pub fn new(dp: u32, value: DatapointValue) -> Self {
        Self {
            dp,
            datatype: DataType::for_value(&value),
            value,
        }
    }
}

/// Successful delivery of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub dp: u8,
    /// Transaction ID of the attempt the device acknowledged
    pub transaction_id: u8,
    pub attempts: u32,
}

/// A single transmit attempt, as seen by the attempt observer
#[derive(Debug, Clone)]
pub struct Attempt {
    pub address: u16,
    pub dp: u8,
    pub attempt: u32,
    pub transaction_id: u8,
    pub outcome: Result<(), TransportError>,
}

/// Telemetry hook invoked after every attempt
pub type AttemptObserver = Arc<dyn Fn(&Attempt) + Send + Sync>;

/// Wraps a transport with the retry policy for one device
pub struct ReliableSender<T> {
    transport: Arc<T>,
    address: u16,
    policy: RetryPolicy,
    observer: Option<AttemptObserver>,
}

impl<T> Clone for ReliableSender<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            address: self.address,
            policy: self.policy,
            observer: self.observer.clone(),
        }
    }
}

impl<T: DatapointTransport> ReliableSender<T> {
    #[must_use]
    pub fn new(transport: Arc<T>, address: u16, policy: RetryPolicy) -> Self {
        Self {
            transport,
            address,
            policy,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send one datapoint, retrying transport failures
    ///
    /// Every attempt draws a fresh transaction ID from `sequencer`. Encoding
    /// errors return before anything is transmitted.
    #[allow(clippy::missing_errors_doc)]
    pub async fn send(
        &self,
        sequencer: &mut Sequencer,
        dp: u32,
        datatype: DataType,
        value: &DatapointValue,
    ) -> Result<Delivery, SendError> {
        let mut frame = codec::encode(sequencer.peek(), dp, datatype, value)?;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            frame.transaction_id = sequencer.next();
            let transaction_id = frame.transaction_id;

            let outcome = if self.transport.is_available(self.address) {
                self.transport.transmit(self.address, frame.clone()).await
            } else {
                Err(TransportError::Unavailable)
            };

            self.report(frame.dp, attempt, transaction_id, &outcome);

            match outcome {
                Ok(()) => {
                    return Ok(Delivery {
                        dp: frame.dp,
                        transaction_id,
                        attempts: attempt,
                    });
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        "Write dp {} to {:#06x} failed (attempt {}/{}): {}, retrying in {:?}",
                        frame.dp,
                        self.address,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Write dp {} to {:#06x} failed after {} attempts: {}",
                        frame.dp,
                        self.address,
                        attempt,
                        e
                    );
                    return Err(SendError::SendExhausted {
                        dp: frame.dp,
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
    }

    /// Send commands one after another, pausing after each delivered one
    ///
    /// A failed command does not stop the rest and is followed directly by
    /// the next command; one result per command.
    pub async fn send_bulk(
        &self,
        sequencer: &mut Sequencer,
        commands: &[DatapointCommand],
        delay_between: Duration,
    ) -> Vec<Result<Delivery, SendError>> {
        let mut results = Vec::with_capacity(commands.len());
        for (i, command) in commands.iter().enumerate() {
            let result = self
                .send(sequencer, command.dp, command.datatype, &command.value)
                .await;
            if result.is_ok() && i + 1 < commands.len() {
                tokio::time::sleep(delay_between).await;
            }
            results.push(result);
        }
        results
    }

    fn report(&self, dp: u8, attempt: u32, transaction_id: u8, outcome: &Result<(), TransportError>) {
        tracing::debug!(
            "Attempt {} for dp {} to {:#06x} (seq {}): {:?}",
            attempt,
            dp,
            self.address,
            transaction_id,
            outcome
        );
        if let Some(observer) = &self.observer {
            observer(&Attempt {
                address: self.address,
                dp,
                attempt,
                transaction_id,
                outcome: outcome.clone(),
            });
        }
    }
}
