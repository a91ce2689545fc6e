//! Per-session output streams and subscriber fan-out.
//!
//! Each session owns an [`OutputStream`], a bounded queue of frames not yet
//! handed to a subscriber. Publishing only appends to that queue under the
//! session lock. The attached subscriber has its own forwarder task that
//! takes queued frames in batches and writes them to the connection after
//! the lock is released, so a connection that stops reading never stalls
//! the session.
//!
//! On overflow the oldest *partial* frame is dropped, so a terminal
//! response or control frame is never lost, and the next batch starts with
//! a [`ServerFrame::Gap`] marker.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, debug_span, Instrument};

use super::registry::{SessionRegistry, SessionSlot};
use crate::models::frame::ServerFrame;
use crate::Result;

/// Live consumer of session output: one websocket connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Connection identifier, unique per server process.
    pub connection_id: u64,
    /// Outbound frame queue of that connection.
    pub sender: mpsc::Sender<ServerFrame>,
}

#[derive(Debug)]
struct Attachment {
    connection_id: u64,
    generation: u64,
    wake: Arc<Notify>,
}

/// Queued output of one session.
#[derive(Debug)]
pub(crate) struct OutputStream {
    next_seq: u64,
    buffer: VecDeque<ServerFrame>,
    capacity: usize,
    dropped: u64,
    attached: Option<Attachment>,
    generation: u64,
    finished: bool,
}

impl OutputStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            buffer: VecDeque::new(),
            capacity,
            dropped: 0,
            attached: None,
            generation: 0,
            finished: false,
        }
    }

    /// Allocate the next partial sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Sequence number the next partial will carry.
    pub fn peek_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn has_subscriber(&self) -> bool {
        self.attached.is_some()
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Queue a frame and wake the forwarder, if any. Never waits.
    pub fn publish(&mut self, frame: ServerFrame) {
        self.buffer_frame(frame);
        if let Some(ref attachment) = self.attached {
            attachment.wake.notify_one();
        }
    }

    /// Make `connection_id` the live subscriber, replacing any previous
    /// one. Returns the attachment generation and the forwarder's wake-up
    /// handle.
    fn attach(&mut self, connection_id: u64) -> (u64, Arc<Notify>) {
        if let Some(previous) = self.attached.take() {
            previous.wake.notify_one();
        }
        self.generation += 1;
        let wake = Arc::new(Notify::new());
        wake.notify_one();
        self.attached = Some(Attachment {
            connection_id,
            generation: self.generation,
            wake: Arc::clone(&wake),
        });
        (self.generation, wake)
    }

    /// Take everything queued for the forwarder of `generation`.
    ///
    /// `None` tells the forwarder to stop: it was detached or replaced, or
    /// the stream is finished and fully drained.
    fn take_batch(&mut self, session_id: &str, generation: u64) -> Option<Vec<ServerFrame>> {
        if !self.is_current(generation) {
            return None;
        }
        let mut batch = Vec::with_capacity(self.buffer.len() + 1);
        if self.dropped > 0 {
            let resume_seq = self
                .buffer
                .iter()
                .find_map(|frame| match frame {
                    ServerFrame::Partial { seq, .. } => Some(*seq),
                    _ => None,
                })
                .unwrap_or(self.next_seq);
            batch.push(ServerFrame::Gap {
                session_id: session_id.to_owned(),
                dropped: self.dropped,
                resume_seq,
            });
            self.dropped = 0;
        }
        batch.extend(self.buffer.drain(..));
        if batch.is_empty() && self.finished {
            self.attached = None;
            return None;
        }
        Some(batch)
    }

    /// Put frames a dead forwarder could not deliver back at the front of
    /// the queue and detach it. Frames of a replaced forwarder are counted
    /// as dropped instead, since newer output already went out.
    fn requeue(&mut self, generation: u64, unsent: Vec<ServerFrame>) {
        let replaced = self
            .attached
            .as_ref()
            .is_some_and(|a| a.generation != generation);
        if replaced {
            let lost = unsent.iter().filter(|f| f.is_partial()).count();
            self.dropped += u64::try_from(lost).unwrap_or(u64::MAX);
            return;
        }
        self.attached = None;
        for frame in unsent.into_iter().rev() {
            match frame {
                ServerFrame::Gap { dropped, .. } => self.dropped += dropped,
                frame => self.buffer.push_front(frame),
            }
        }
        while self.buffer.len() > self.capacity {
            let Some(index) = self.buffer.iter().position(ServerFrame::is_partial) else {
                break;
            };
            self.buffer.remove(index);
            self.dropped += 1;
        }
    }

    /// Detach the subscriber if it belongs to `connection_id`.
    pub fn detach(&mut self, connection_id: u64) -> bool {
        if self
            .attached
            .as_ref()
            .is_some_and(|a| a.connection_id == connection_id)
        {
            self.drop_attachment();
            true
        } else {
            false
        }
    }

    /// No more output follows; the forwarder stops once it has delivered
    /// what is queued.
    pub fn finish(&mut self) {
        self.finished = true;
        if let Some(ref attachment) = self.attached {
            attachment.wake.notify_one();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    fn drop_attachment(&mut self) {
        if let Some(attachment) = self.attached.take() {
            attachment.wake.notify_one();
        }
    }

    fn buffer_frame(&mut self, frame: ServerFrame) {
        if self.buffer.len() >= self.capacity {
            if let Some(index) = self.buffer.iter().position(ServerFrame::is_partial) {
                self.buffer.remove(index);
                self.dropped += 1;
            } else if frame.is_partial() {
                self.dropped += 1;
                return;
            }
        }
        self.buffer.push_back(frame);
    }
}

/// Routes backend output to session streams and manages subscriptions.
#[derive(Debug, Clone)]
pub struct StreamDispatcher {
    registry: Arc<SessionRegistry>,
}

impl StreamDispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Attach `subscriber` as the live consumer of a session's output.
    ///
    /// Queued output, preceded by a gap marker when some was dropped, is
    /// delivered first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for unknown ids and
    /// `AppError::InvalidSessionState` for closed sessions.
    pub async fn subscribe(&self, session_id: &str, subscriber: Subscriber) -> Result<()> {
        let slot = self.registry.slot(session_id)?;
        let (generation, wake) = {
            let mut entry = slot.state.lock().await;
            if entry.is_closed() {
                return Err(crate::AppError::InvalidSessionState(format!(
                    "session {session_id} is closed"
                )));
            }
            entry.stream.attach(subscriber.connection_id)
        };
        debug!(session_id, connection_id = subscriber.connection_id, generation, "subscriber attached");
        spawn_forwarder(slot, subscriber, generation, wake);
        Ok(())
    }

    /// Detach a connection from every session it is subscribed to.
    ///
    /// Returns the number of sessions that lost their subscriber.
    pub async fn detach_connection(&self, connection_id: u64) -> usize {
        let mut detached = 0;
        for slot in self.registry.slots() {
            if slot.state.lock().await.stream.detach(connection_id) {
                detached += 1;
            }
        }
        detached
    }

    /// Append a partial fragment to a session's stream, returning its
    /// sequence number.
    pub(crate) async fn publish_partial(&self, slot: &SessionSlot, text: String) -> Option<u64> {
        let mut entry = slot.state.lock().await;
        if entry.is_closed() {
            return None;
        }
        let seq = entry.stream.next_seq();
        entry.stream.publish(ServerFrame::Partial {
            session_id: slot.id.clone(),
            seq,
            text,
        });
        Some(seq)
    }

    /// Mark the start of a channel prompt's turn with the sequence number
    /// its first partial will carry.
    pub(crate) async fn publish_turn_start(&self, slot: &SessionSlot, request_id: String) {
        let mut entry = slot.state.lock().await;
        if entry.is_closed() {
            return;
        }
        let first_seq = entry.stream.peek_seq();
        entry.stream.publish(ServerFrame::TurnStarted {
            session_id: slot.id.clone(),
            request_id,
            first_seq,
        });
    }

    /// Append a non-partial frame to a session's stream.
    pub(crate) async fn publish(&self, slot: &SessionSlot, frame: ServerFrame) {
        let mut entry = slot.state.lock().await;
        if entry.is_closed() {
            return;
        }
        entry.stream.publish(frame);
    }
}

/// Move queued frames of one session to one connection until the
/// attachment ends.
fn spawn_forwarder(
    slot: Arc<SessionSlot>,
    subscriber: Subscriber,
    generation: u64,
    wake: Arc<Notify>,
) {
    let span = debug_span!(
        "forwarder",
        session_id = %slot.id,
        connection_id = subscriber.connection_id,
        generation
    );
    tokio::spawn(
        async move {
            let sender = subscriber.sender;
            loop {
                let batch = slot.state.lock().await.stream.take_batch(&slot.id, generation);
                let Some(batch) = batch else {
                    break;
                };
                if batch.is_empty() {
                    tokio::select! {
                        () = wake.notified() => continue,
                        () = sender.closed() => {
                            slot.state.lock().await.stream.requeue(generation, Vec::new());
                            debug!("connection gone");
                            break;
                        }
                    }
                }
                let mut frames = batch.into_iter();
                while let Some(frame) = frames.next() {
                    if let Err(mpsc::error::SendError(frame)) = sender.send(frame).await {
                        let mut unsent = vec![frame];
                        unsent.extend(frames);
                        debug!(unsent = unsent.len(), "connection gone; output queued again");
                        slot.state.lock().await.stream.requeue(generation, unsent);
                        return;
                    }
                }
            }
            debug!("forwarder stopped");
        }
        .instrument(span),
    );
}
