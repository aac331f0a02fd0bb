//! Messages moved by receivers, dispatchers and requesters.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Readable stream carried by a [`Payload::Stream`].
pub type PayloadStream = Box<dyn AsyncRead + Send + Unpin>;

pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    /// Still-open stream; consumers read it to the end and drop it
    Stream(PayloadStream),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Payload::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Message {
    payload: Payload,
    properties: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            properties: HashMap::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Bytes(bytes.into()))
    }

    pub fn stream(stream: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::new(Payload::Stream(Box::new(stream)))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.payload, Payload::Stream(_))
    }

    /// Text view of a non-stream payload.
    pub fn as_text(&self) -> Option<String> {
        match &self.payload {
            Payload::Text(text) => Some(text.clone()),
            Payload::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Payload::Empty | Payload::Stream(_) => None,
        }
    }

    /// Read the payload to completion, consuming any stream.
    pub async fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self.payload {
            Payload::Empty => Ok(Vec::new()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Stream(mut stream) => {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }

    /// Tie `resource` to this message's lifetime.
    ///
    /// For a stream payload the resource is held by the stream and released
    /// when the stream is closed or dropped. For any other payload it is
    /// released immediately.
    pub(crate) fn release_with<R: Send + 'static>(self, resource: R) -> Message {
        match self.payload {
            Payload::Stream(stream) => Message {
                payload: Payload::Stream(Box::new(ReturningStream::new(stream, resource))),
                properties: self.properties,
            },
            payload => {
                drop(resource);
                Message {
                    payload,
                    properties: self.properties,
                }
            }
        }
    }
}

/// Stream that keeps a borrowed resource checked out until it is closed.
pub struct ReturningStream {
    inner: PayloadStream,
    resource: Option<Box<dyn Send>>,
}

impl ReturningStream {
    pub fn new<R: Send + 'static>(inner: PayloadStream, resource: R) -> Self {
        Self {
            inner,
            resource: Some(Box::new(resource)),
        }
    }

    /// Release the held resource now. Further reads still reach the inner stream.
    pub fn close(&mut self) {
        self.resource.take();
    }

    pub fn is_closed(&self) -> bool {
        self.resource.is_none()
    }
}

impl AsyncRead for ReturningStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
