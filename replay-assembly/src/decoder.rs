use bytes::{Bytes, BytesMut};
use replay_wire::{
    http::{discard_line, looks_like_response, HttpError, RequestCodec},
    Level, Message,
};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::{ConnectionKey, Flow, StreamFactory, StreamSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing received yet.
    Start,
    Requests,
    /// The stream carries responses.
    Ignored,
}

/// Decodes HTTP requests from the reassembled bytes of one half stream.
///
/// Every chunk is queued as a [`Level::TCP`] message, every decoded request as a
/// [`Level::HTTP`] message carrying its re-serialized form. Malformed input is skipped line by
/// line, oversized bodies are skipped whole when their length is known. Streams that start like
/// a response are ignored entirely.
#[derive(Debug)]
pub(crate) struct StreamDecoder {
    flow: Flow,
    codec: RequestCodec,
    buf: BytesMut,
    state: State,
    /// Bytes were lost since the last chunk.
    gap: bool,
    /// Bytes of an oversized request still to be discarded.
    skip: usize,
    outbox: mpsc::UnboundedSender<Message>,
}

impl StreamDecoder {
    fn queue(&self, msg: Message) {
        // The receiver lives as long as the driver
        let _ = self.outbox.send(msg);
    }

    fn decode(&mut self) {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                let _ = self.buf.split_to(n);
                self.skip -= n;
                if self.skip > 0 {
                    return;
                }
            }

            match self.codec.decode(&mut self.buf) {
                Ok(Some(request)) => {
                    trace!(flow = %self.flow, method = %request.method(), target = request.path_and_query(), "Decoded request");
                    self.queue(Message::new(Level::HTTP, request.to_bytes()));
                }
                Ok(None) => return,
                Err(HttpError::BodyTooLarge { limit, skip: Some(len) }) => {
                    warn!(flow = %self.flow, limit, len, "Request body too large, skipping request");
                    self.skip = len;
                }
                Err(e) => {
                    warn!(flow = %self.flow, err = ?e, "Malformed request, resynchronizing");
                    discard_line(&mut self.buf);
                }
            }
        }
    }
}

impl StreamSink for StreamDecoder {
    fn reassembled(&mut self, data: Bytes) {
        match self.state {
            State::Ignored => return,
            State::Start if looks_like_response(&data) => {
                trace!(flow = %self.flow, "Ignoring response stream");
                self.state = State::Ignored;
                return;
            }
            State::Start => self.state = State::Requests,
            State::Requests => {}
        }

        if self.gap {
            self.gap = false;
            if !self.buf.is_empty() || self.skip > 0 {
                debug!(flow = %self.flow, dropped = self.buf.len(), "Discarding partial request after gap");
                self.buf.clear();
                self.skip = 0;
            }
        }

        self.queue(Message::new(Level::TCP, data.clone()));
        self.buf.extend_from_slice(&data);
        self.decode();
    }

    fn skipped(&mut self, bytes: u64) {
        trace!(flow = %self.flow, bytes, "Skipped missing bytes");
        self.gap = true;
    }

    fn finished(&mut self) {
        if !self.buf.is_empty() {
            debug!(flow = %self.flow, remaining = self.buf.len(), "Stream ended with an incomplete request");
            self.buf.clear();
        }
    }
}

/// Creates a [`StreamDecoder`] for every half stream, all queueing into the same outbox.
#[derive(Debug)]
pub(crate) struct DecoderFactory {
    codec: RequestCodec,
    outbox: mpsc::UnboundedSender<Message>,
}

impl DecoderFactory {
    pub(crate) fn new(codec: RequestCodec) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (Self { codec, outbox }, rx)
    }
}

impl StreamFactory for DecoderFactory {
    type Sink = StreamDecoder;

    fn new_stream(&mut self, _key: &ConnectionKey, flow: Flow) -> StreamDecoder {
        StreamDecoder {
            flow,
            codec: self.codec.clone(),
            buf: BytesMut::new(),
            state: State::Start,
            gap: false,
            skip: 0,
            outbox: self.outbox.clone(),
        }
    }
}
