//! Control signals delivered to a running protocol client.

use std::{
    fmt::{Display, Formatter},
    time::{Duration, Instant},
};

use futures::{
    future::{select, Either},
    pin_mut,
};
use tokio::sync::mpsc::Receiver;

/// The signals a client's `run` loop can receive from the bridge.
#[derive(Debug)]
#[non_exhaustive]
pub enum Signal {
    /// Signal triggered by a timer (used by the reconnect backoff clock).
    TimerTick {
        /// Timestamp of the signal.
        instant: Instant,
    },
    /// Signal received when the client must stop.
    Stop,
}

impl Signal {
    /// Returns the name of this signal.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::TimerTick { .. } => "TimerTick",
            Signal::Stop => "Stop",
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A signal receiver that can be used by a client's `run` loop to wait on
/// either a stop signal or its own internal timer.
pub enum SignalReceiver {
    /// Only a stop-signal channel, no timer.
    Receiver {
        /// The underlying channel receiver.
        receiver: Receiver<Signal>,
    },
    /// A stop-signal channel plus a periodic timer, used by clients that
    /// poll (e.g. Modbus) or need a backoff clock.
    ReceiverTimer {
        /// The underlying channel receiver.
        receiver: Receiver<Signal>,
        /// The timer interval.
        interval: tokio::time::Interval,
    },
}

impl SignalReceiver {
    /// Creates a receiver with only a stop-signal channel.
    pub fn with_receiver(receiver: Receiver<Signal>) -> Self {
        SignalReceiver::Receiver { receiver }
    }

    /// Creates a receiver with a stop-signal channel and a periodic timer.
    pub fn with_receiver_timer(receiver: Receiver<Signal>, duration: Duration) -> Self {
        SignalReceiver::ReceiverTimer {
            receiver,
            interval: tokio::time::interval(duration),
        }
    }

    /// Returns the next signal.
    pub async fn recv(&mut self) -> Signal {
        match self {
            SignalReceiver::Receiver { receiver } => match receiver.recv().await {
                Some(signal) => signal,
                None => Signal::Stop,
            },
            SignalReceiver::ReceiverTimer { receiver, interval } => {
                let interval_fut = interval.tick();
                let receiver_fut = receiver.recv();

                pin_mut!(interval_fut, receiver_fut);

                match select(interval_fut, receiver_fut).await {
                    Either::Left((instant, _)) => Signal::TimerTick {
                        instant: instant.into_std(),
                    },
                    Either::Right((signal, _)) => signal.unwrap_or(Signal::Stop),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Signal, SignalReceiver};

    #[tokio::test]
    async fn stop_signal_takes_priority_over_backlog() {
        let (sender, receiver) = tokio::sync::mpsc::channel(10);
        let mut signal_receiver = SignalReceiver::with_receiver_timer(receiver, Duration::from_secs(1));

        sender.send(Signal::Stop).await.unwrap();

        match signal_receiver.recv().await {
            Signal::Stop => {}
            Signal::TimerTick { .. } => panic!("unexpected timer tick"),
        }
    }
}
