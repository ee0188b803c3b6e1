//! Heartbeat ping/pong liveness monitoring.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;
use crate::transport::ChannelSender;

/// Heartbeat parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// How long to wait for the matching pong.
    pub timeout: Duration,
    /// Consecutive misses before the channel is declared dead.
    pub max_missed: u32,
}

/// Progress reported while the heartbeat runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A ping went out.
    Ping {
        /// Sequence number of the ping.
        seq: u64,
    },
    /// The matching pong arrived.
    Pong {
        /// Sequence number echoed by the server.
        seq: u64,
        /// Round-trip time.
        rtt: Duration,
    },
    /// No pong within the timeout.
    Missed {
        /// Sequence number of the unanswered ping.
        seq: u64,
        /// Consecutive misses so far.
        consecutive: u32,
    },
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// `max_missed` consecutive pings went unanswered.
    TimedOut {
        /// Consecutive misses at the time of giving up.
        missed: u32,
    },
    /// The heartbeat was cancelled externally.
    Cancelled,
    /// The channel refused a ping or the pong feed ended.
    ChannelClosed,
}

/// Run heartbeat pings on a channel.
///
/// Every `interval` a `ping{seq}` is sent and the matching `pong{seq}` is
/// awaited on `pongs` for at most `timeout`. Stale pongs (lower `seq`) are
/// ignored. A pong resets the miss counter; reaching `max_missed`
/// consecutive misses returns [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat(
    sender: ChannelSender,
    mut pongs: mpsc::UnboundedReceiver<u64>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
    mut on_event: impl FnMut(HeartbeatEvent) + Send,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = config.max_missed.max(1);
    let mut missed: u32 = 0;
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }

        seq += 1;
        if sender.send(Envelope::ping(seq)).is_err() {
            return HeartbeatResult::ChannelClosed;
        }
        on_event(HeartbeatEvent::Ping { seq });
        let sent_at = Instant::now();

        let answered = tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            answered = time::timeout(config.timeout, wait_for_pong(&mut pongs, seq)) => answered,
        };

        match answered {
            Ok(true) => {
                missed = 0;
                on_event(HeartbeatEvent::Pong {
                    seq,
                    rtt: sent_at.elapsed(),
                });
            }
            Ok(false) => return HeartbeatResult::ChannelClosed,
            Err(_) => {
                missed += 1;
                on_event(HeartbeatEvent::Missed {
                    seq,
                    consecutive: missed,
                });
                if missed >= max_missed {
                    return HeartbeatResult::TimedOut { missed };
                }
            }
        }
    }
}

/// Wait for a pong with `seq`. Returns `false` if the feed closed.
async fn wait_for_pong(pongs: &mut mpsc::UnboundedReceiver<u64>, seq: u64) -> bool {
    while let Some(got) = pongs.recv().await {
        if got == seq {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events;
    use crate::transport::{ChannelDriver, channel_pair};
    use std::sync::Arc;
    use parking_lot::Mutex;
    use tableside_core::TransportKind;

    fn config(max_missed: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            max_missed,
        }
    }

    /// Answer every ping whose seq satisfies `answer`.
    fn responder(
        mut driver: ChannelDriver,
        pong_tx: mpsc::UnboundedSender<u64>,
        answer: impl Fn(u64) -> bool + Send + 'static,
    ) {
        drop(tokio::spawn(async move {
            while let Some(env) = driver.outbound.recv().await {
                if env.event == events::PING {
                    let seq = env.seq().unwrap();
                    if answer(seq) {
                        let _ = pong_tx.send(seq);
                    }
                }
            }
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_cancelled() {
        let (channel, _driver) = channel_pair(TransportKind::Memory);
        let (_pong_tx, pong_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(channel.sender, pong_rx, config(3), cancel2, |_| {}).await
        });

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_max_missed() {
        let (channel, driver) = channel_pair(TransportKind::Memory);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        responder(driver, pong_tx, |_| false);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let start = Instant::now();
        let result = run_heartbeat(channel.sender, pong_rx, config(3), CancellationToken::new(), move |e| {
            sink.lock().push(e);
        })
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut { missed: 3 });
        let misses: Vec<u32> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HeartbeatEvent::Missed { consecutive, .. } => Some(*consecutive),
                _ => None,
            })
            .collect();
        assert_eq!(misses, vec![1, 2, 3]);
        // Three intervals plus three pong timeouts.
        assert!(start.elapsed() >= Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_resets_miss_counter() {
        let (channel, driver) = channel_pair(TransportKind::Memory);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        // Miss 1 and 2, answer 3, then miss 4, 5, 6.
        responder(driver, pong_tx, |seq| seq == 3);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let result = run_heartbeat(channel.sender, pong_rx, config(3), CancellationToken::new(), move |e| {
            sink.lock().push(e);
        })
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut { missed: 3 });
        let recorded = events.lock();
        assert!(recorded.iter().any(|e| matches!(e, HeartbeatEvent::Pong { seq: 3, .. })));
        let last_seq = recorded.iter().filter_map(|e| match e {
            HeartbeatEvent::Ping { seq } => Some(*seq),
            _ => None,
        });
        assert_eq!(last_seq.max(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pongs_are_ignored() {
        let (channel, mut driver) = channel_pair(TransportKind::Memory);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(async move {
            while let Some(env) = driver.outbound.recv().await {
                // Always answer with a stale sequence number.
                let _ = pong_tx.send(env.seq().unwrap() - 1);
            }
        }));

        let result = run_heartbeat(
            channel.sender,
            pong_rx,
            config(2),
            CancellationToken::new(),
            |_| {},
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut { missed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_channel_reports_rtt() {
        let (channel, driver) = channel_pair(TransportKind::Memory);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        responder(driver, pong_tx, |_| true);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let result = run_heartbeat(channel.sender, pong_rx, config(3), cancel, move |e| {
            if let HeartbeatEvent::Pong { seq, rtt } = e {
                assert!(rtt < Duration::from_secs(2));
                if seq == 5 {
                    stop.cancel();
                }
            }
        })
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_ends_heartbeat() {
        let (channel, _driver) = channel_pair(TransportKind::Memory);
        let (_pong_tx, pong_rx) = mpsc::unbounded_channel();
        let sender = channel.sender.clone();
        channel.close();

        let result = run_heartbeat(sender, pong_rx, config(3), CancellationToken::new(), |_| {}).await;
        assert_eq!(result, HeartbeatResult::ChannelClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_pong_feed_ends_heartbeat() {
        let (channel, _driver) = channel_pair(TransportKind::Memory);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel::<u64>();
        drop(pong_tx);

        let result = run_heartbeat(channel.sender, pong_rx, config(3), CancellationToken::new(), |_| {}).await;
        assert_eq!(result, HeartbeatResult::ChannelClosed);
    }
}
