//! Async driver for the jitter buffer
//!
//! [`JitterSession`] runs a [`JitterBuffer`] against the tokio clock: a
//! background task sleeps until the engine's next deadline, fires it, and
//! forwards the resulting events over a channel. Pushing a packet never
//! blocks; it stamps the arrival time, feeds the engine and nudges the task
//! so freshly armed deadlines are picked up.
//!
//! All engine state mutation stays serialized behind one mutex, matching
//! the engine's single-writer design.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::JitterBufferConfig;
use crate::jitter::{JitterBuffer, JitterBufferEvent, JitterBufferStats, PushResult};
use crate::packet::Packet;
use crate::{ClockTime, Error, Result};

/// Default capacity of the outgoing event channel
const EVENT_CHANNEL_SIZE: usize = 256;

/// A jitter buffer driven by the tokio clock
pub struct JitterSession {
    /// The engine, shared with the timer task
    engine: Arc<Mutex<JitterBuffer>>,

    /// Wakes the timer task after a push or reconfiguration
    notify: Arc<Notify>,

    /// Start of this session's running-time axis
    epoch: Instant,

    /// Timer task handle
    task: Option<JoinHandle<()>>,
}

impl JitterSession {
    /// Start a session; events are delivered on the returned receiver
    pub fn new(
        config: JitterBufferConfig,
    ) -> Result<(Self, mpsc::Receiver<JitterBufferEvent>)> {
        let engine = Arc::new(Mutex::new(JitterBuffer::new(config)?));
        let notify = Arc::new(Notify::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let epoch = Instant::now();

        let task = tokio::spawn(run_timers(
            engine.clone(),
            notify.clone(),
            event_tx,
            epoch,
        ));

        debug!("jitter session started");
        Ok((
            Self {
                engine,
                notify,
                epoch,
                task: Some(task),
            },
            event_rx,
        ))
    }

    /// Feed one packet, stamping its arrival with the session clock
    pub fn push(&self, mut packet: Packet) -> Result<PushResult> {
        packet.arrival = self.running_time();
        let result = self.lock()?.push(packet);
        self.notify.notify_one();
        Ok(result)
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> Result<JitterBufferStats> {
        Ok(self.lock()?.stats())
    }

    /// Shift all deadlines and outgoing timestamps
    pub fn set_ts_offset(&self, offset: i64) -> Result<()> {
        self.lock()?.set_ts_offset(offset);
        self.notify.notify_one();
        Ok(())
    }

    /// Drop all buffered state and zero the statistics
    pub fn flush(&self) -> Result<()> {
        self.lock()?.flush();
        self.notify.notify_one();
        Ok(())
    }

    /// Time elapsed on this session's running-time axis
    pub fn running_time(&self) -> ClockTime {
        self.epoch.elapsed().as_nanos() as ClockTime
    }

    /// Stop the timer task and drop the engine
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        debug!("jitter session closed");
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, JitterBuffer>> {
        self.engine
            .lock()
            .map_err(|_| Error::SessionError("engine lock poisoned".to_string()))
    }
}

impl Drop for JitterSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Timer loop: sleep until the earliest engine deadline, fire it, forward
/// the output.
async fn run_timers(
    engine: Arc<Mutex<JitterBuffer>>,
    notify: Arc<Notify>,
    event_tx: mpsc::Sender<JitterBufferEvent>,
    epoch: Instant,
) {
    loop {
        let wakeup = match engine.lock() {
            Ok(guard) => guard.next_wakeup(),
            Err(_) => {
                warn!("engine lock poisoned, stopping timer task");
                return;
            }
        };

        match wakeup {
            Some(deadline) => {
                let target = epoch + Duration::from_nanos(deadline);
                tokio::select! {
                    _ = tokio::time::sleep_until(target) => {}
                    _ = notify.notified() => continue,
                }
            }
            None => {
                // nothing pending; wait for a push
                notify.notified().await;
                continue;
            }
        }

        let now = epoch.elapsed().as_nanos() as ClockTime;
        let events = match engine.lock() {
            Ok(mut guard) => guard.advance(now),
            Err(_) => return,
        };

        for event in events {
            if event_tx.send(event).await.is_err() {
                debug!("event receiver dropped, stopping timer task");
                return;
            }
        }
    }
}
