//! Egress frame buffer
//!
//! Smooths burst audio from the model into carrier-paced 20 ms μ-law
//! frames. The model emits tens to hundreds of milliseconds of speech per
//! event; the carrier expects one 160-byte frame every 20 ms. The buffer
//! never learns the wire format: frames leave through a plain byte sink.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// One 20 ms μ-law frame at 8 kHz
pub const FRAME_BYTES: usize = 160;

/// Carrier frame cadence
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Queue cap: 2 s of audio. Beyond this the oldest half is dropped.
pub const MAX_QUEUED_FRAMES: usize = 100;

/// μ-law encoding of digital silence
pub const ULAW_SILENCE: u8 = 0xFF;

struct Inner {
    queue: VecDeque<Vec<u8>>,
    shutdown: bool,
}

/// Paced egress queue toward the carrier.
///
/// `enqueue` accepts arbitrary byte runs; a background pacer releases one
/// frame per tick into the sink until the queue drains, then parks.
pub struct FrameBuffer {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl FrameBuffer {
    /// Create the buffer and start its pacer, releasing frames into `sink`
    pub fn new(sink: mpsc::Sender<Vec<u8>>) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            shutdown: false,
        }));
        let notify = Arc::new(Notify::new());

        tokio::spawn(pacer(Arc::clone(&inner), Arc::clone(&notify), sink));

        Self { inner, notify }
    }

    /// Split `bytes` into 160-byte frames and queue them.
    ///
    /// A trailing partial frame is padded to full size with μ-law silence.
    /// Arms the pacer if it is parked.
    pub fn enqueue(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("frame queue lock");
        if inner.shutdown {
            return;
        }
        for chunk in bytes.chunks(FRAME_BYTES) {
            let mut frame = chunk.to_vec();
            if frame.len() < FRAME_BYTES {
                frame.resize(FRAME_BYTES, ULAW_SILENCE);
            }
            inner.queue.push_back(frame);
        }
        if inner.queue.len() > MAX_QUEUED_FRAMES {
            let drop_count = MAX_QUEUED_FRAMES / 2;
            warn!(
                queued = inner.queue.len(),
                dropping = drop_count,
                "Egress queue overflow, dropping oldest frames"
            );
            inner.queue.drain(..drop_count);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Drop all pending frames. Used for barge-in.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("frame queue lock");
        let dropped = inner.queue.len();
        inner.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared egress queue");
        }
    }

    /// Stop permanently; pending frames are discarded and the pacer exits
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("frame queue lock");
        inner.shutdown = true;
        inner.queue.clear();
        drop(inner);
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.lock().expect("frame queue lock").queue.len()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pacer(inner: Arc<Mutex<Inner>>, notify: Arc<Notify>, sink: mpsc::Sender<Vec<u8>>) {
    loop {
        // Park until there is work
        loop {
            {
                let guard = inner.lock().expect("frame queue lock");
                if guard.shutdown {
                    return;
                }
                if !guard.queue.is_empty() {
                    break;
                }
            }
            notify.notified().await;
        }

        // Release one frame per tick until the queue drains
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let frame = {
                let mut guard = inner.lock().expect("frame queue lock");
                if guard.shutdown {
                    return;
                }
                guard.queue.pop_front()
            };
            match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        // Sink closed: the call is gone
                        return;
                    }
                }
                None => break,
            }
        }
    }
}
