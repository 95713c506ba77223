/// Per-connection send queue and backpressure controller
///
/// Every connection owns a bounded FIFO of frames that the transport could
/// not take yet. While the FIFO is non-empty, new frames always queue behind
/// it so a connection never sees frames out of order. A full FIFO drops the
/// newest frame and keeps the rest.
use std::collections::VecDeque;
use tokio::sync::mpsc;

use super::hub::ConnectionId;
use super::message::Frame;
use super::metrics::ConnectionStats;
use crate::errors::BrokerError;

/// Item handed to a connection's socket task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Frame),
    /// Liveness probe
    Ping,
    /// Close the socket
    Close,
}

/// Channel into a connection's socket task
///
/// Its bounded capacity is the transport buffer: a full channel means the
/// socket is not writable right now.
pub type ConnectionSender = mpsc::Sender<Outgoing>;

/// What happened to a frame handed to `enqueue_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed straight to the transport
    Sent,
    /// Waiting in the send queue
    Queued,
    /// Send queue full, frame discarded
    Dropped,
}

pub struct SendQueue {
    id: ConnectionId,
    sink: ConnectionSender,
    frames: VecDeque<Frame>,
    capacity: usize,
    stats: ConnectionStats,
}

impl SendQueue {
    pub fn new(id: ConnectionId, sink: ConnectionSender, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            sink,
            frames: VecDeque::with_capacity(capacity),
            capacity,
            stats: ConnectionStats::default(),
        }
    }

    fn transmit(&self, frame: &Frame) -> Result<(), BrokerError> {
        match self.sink.try_send(Outgoing::Frame(frame.clone())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BrokerError::TransportNotReady(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::ConnectionGone(self.id)),
        }
    }

    /// Send now if nothing is waiting and the transport is ready, else queue
    ///
    /// Returns `ConnectionGone` when the socket task has exited.
    pub fn enqueue_frame(&mut self, frame: Frame) -> Result<EnqueueOutcome, BrokerError> {
        if self.frames.is_empty() {
            match self.transmit(&frame) {
                Ok(()) => {
                    self.stats.inc_sent();
                    return Ok(EnqueueOutcome::Sent);
                }
                Err(BrokerError::TransportNotReady(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if self.frames.len() >= self.capacity {
            self.stats.inc_overflow();
            return Ok(EnqueueOutcome::Dropped);
        }

        self.frames.push_back(frame);
        self.stats.set_queue_size(self.frames.len());
        Ok(EnqueueOutcome::Queued)
    }

    /// Flush queued frames until the transport pushes back
    ///
    /// A frame the transport refuses goes back to the front. Returns the
    /// number of frames sent.
    pub fn drain(&mut self) -> Result<usize, BrokerError> {
        let mut sent = 0;
        while let Some(frame) = self.frames.pop_front() {
            match self.transmit(&frame) {
                Ok(()) => {
                    self.stats.inc_sent();
                    sent += 1;
                }
                Err(e) => {
                    self.frames.push_front(frame);
                    self.stats.set_queue_size(self.frames.len());
                    return match e {
                        BrokerError::TransportNotReady(_) => Ok(sent),
                        other => Err(other),
                    };
                }
            }
        }
        self.stats.set_queue_size(0);
        Ok(sent)
    }

    /// Ask the socket task to send a liveness probe
    pub fn send_ping(&self) -> Result<(), BrokerError> {
        match self.sink.try_send(Outgoing::Ping) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BrokerError::TransportNotReady(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::ConnectionGone(self.id)),
        }
    }

    /// Discard pending frames and ask the socket task to close, best-effort
    pub fn close(&mut self) -> usize {
        let discarded = self.frames.len();
        self.frames.clear();
        self.stats.set_queue_size(0);
        let _ = self.sink.try_send(Outgoing::Close);
        discarded
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ConnectionStats {
        &mut self.stats
    }
}
