//! Client-side routing of inbound channel frames.
//!
//! Streaming prompts register a route keyed by their request id. The
//! receive loop hands every frame to [`FrameRouter::route`] synchronously,
//! so routes observe frames in arrival order. A route takes partial chunks
//! of its session only after the server's `turn_started` frame for its
//! request, so output replayed from earlier turns is never attributed to
//! it; chunks are de-duplicated by sequence number.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::models::frame::ServerFrame;
use crate::models::response::{AssistantResponse, PartialChunk};
use crate::{AppError, Result};

/// Event delivered to a waiting streaming prompt.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// Server allocated a session for the prompt.
    Started(String),
    /// Next partial chunk, in sequence order.
    Partial(PartialChunk),
    /// Terminal outcome.
    Done(Result<AssistantResponse>),
}

#[derive(Debug)]
struct Route {
    request_id: String,
    session_id: Option<String>,
    turn_started: bool,
    last_seq: u64,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

/// Routes frames to waiting prompts and observers.
#[derive(Debug)]
pub(crate) struct FrameRouter {
    routes: Vec<Route>,
    events: broadcast::Sender<ServerFrame>,
}

impl FrameRouter {
    pub fn new(events: broadcast::Sender<ServerFrame>) -> Self {
        Self {
            routes: Vec::new(),
            events,
        }
    }

    /// Register a streaming prompt.
    pub fn register(
        &mut self,
        request_id: String,
        session_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.push(Route {
            request_id,
            session_id,
            turn_started: false,
            last_seq: 0,
            tx,
        });
        rx
    }

    /// Forget a route whose caller stopped waiting.
    pub fn unregister(&mut self, request_id: &str) {
        self.routes.retain(|r| r.request_id != request_id);
    }

    /// Dispatch one inbound frame.
    pub fn route(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SessionStarted {
                ref request_id,
                ref session_id,
            } => {
                if let Some(route) = self.routes.iter_mut().find(|r| &r.request_id == request_id) {
                    route.session_id = Some(session_id.clone());
                    let _ = route.tx.send(StreamEvent::Started(session_id.clone()));
                }
            }
            ServerFrame::TurnStarted {
                ref request_id,
                ref session_id,
                first_seq,
            } => {
                if let Some(route) = self.routes.iter_mut().find(|r| &r.request_id == request_id) {
                    route.session_id = Some(session_id.clone());
                    route.turn_started = true;
                    route.last_seq = first_seq.saturating_sub(1);
                }
            }
            ServerFrame::Partial {
                ref session_id,
                seq,
                ref text,
            } => {
                if let Some(route) = self.routes.iter_mut().find(|r| {
                    r.turn_started && r.session_id.as_deref() == Some(session_id.as_str())
                }) {
                    if seq <= route.last_seq {
                        debug!(session_id, seq, last = route.last_seq, "duplicate partial dropped");
                    } else {
                        route.last_seq = seq;
                        let _ = route.tx.send(StreamEvent::Partial(PartialChunk {
                            session_id: session_id.clone(),
                            seq,
                            text: text.clone(),
                        }));
                    }
                }
            }
            ServerFrame::Gap {
                ref session_id,
                dropped,
                resume_seq,
            } => {
                warn!(session_id, dropped, resume_seq, "server dropped buffered partials");
            }
            ServerFrame::Response {
                request_id: Some(ref request_id),
                ref response,
                ..
            } => self.finish(request_id, Ok(response.clone())),
            ServerFrame::Error {
                request_id: Some(ref request_id),
                ref kind,
                ref message,
                ..
            } => self.finish(request_id, Err(AppError::from_wire(kind, message.clone()))),
            ServerFrame::SessionClosed {
                ref session_id,
                ref reason,
            } => {
                let err = AppError::InvalidSessionState(format!(
                    "session {session_id} closed: {reason}"
                ));
                self.routes.retain(|route| {
                    if route.session_id.as_deref() == Some(session_id.as_str()) {
                        let _ = route.tx.send(StreamEvent::Done(Err(err.clone())));
                        false
                    } else {
                        true
                    }
                });
            }
            _ => {}
        }
        let _ = self.events.send(frame);
    }

    /// Fail every waiting prompt, e.g. on channel loss.
    pub fn fail_all(&mut self, err: &AppError) {
        for route in self.routes.drain(..) {
            let _ = route.tx.send(StreamEvent::Done(Err(err.clone())));
        }
    }

    fn finish(&mut self, request_id: &str, outcome: Result<AssistantResponse>) {
        if let Some(index) = self.routes.iter().position(|r| r.request_id == request_id) {
            let route = self.routes.remove(index);
            let _ = route.tx.send(StreamEvent::Done(outcome));
        }
    }
}
