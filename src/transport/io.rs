use std::{
    io::{self, BufReader, BufWriter, Read, Write},
    net::{Shutdown, TcpStream},
    sync::mpsc,
};

use bincode::{
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read,
    encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use log::debug;
use thiserror::Error;

use super::Frame;
use crate::{Status, codec};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] EncodeError),
    #[error("failed to decode frame: {0}")]
    Deserialize(#[from] DecodeError),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for Status {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Serialize(_) | TransportError::Deserialize(_) => {
                Status::internal(value.to_string())
            }
            TransportError::Io(_) | TransportError::Closed => Status::unknown(value.to_string()),
        }
    }
}

/// Outgoing half of a connection.
pub(crate) trait FrameSink: Send {
    fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Stops the flow of frames in both directions.
    fn close(&mut self);
}

/// Incoming half of a connection. `Ok(None)` means the peer closed it.
pub(crate) trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Writes bincode-encoded frames to a byte stream.
pub struct FrameWriter<W: Write> {
    stream: BufWriter<W>,
    config: Configuration<BigEndian, Fixint>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: BufWriter::new(stream),
            config: codec::config(),
        }
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        encode_into_std_write(frame, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W, TransportError> {
        self.stream
            .into_inner()
            .map_err(|e| TransportError::Io(e.into_error()))
    }
}

/// Reads bincode-encoded frames from a byte stream.
///
/// A frame larger than the connection limit is an error, not an allocation.
pub struct FrameReader<R: Read> {
    stream: BufReader<R>,
    config: Configuration<BigEndian, Fixint, Limit<{ codec::MAX_FRAME_SIZE }>>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream: BufReader::new(stream),
            config: codec::frame_config(),
        }
    }

    /// Reads the next frame; `Ok(None)` once the stream has ended.
    pub fn read(&mut self) -> Result<Option<Frame>, TransportError> {
        match decode_from_std_read(&mut self.stream, self.config) {
            Ok(frame) => Ok(Some(frame)),
            Err(DecodeError::UnexpectedEnd { .. }) => Ok(None),
            Err(DecodeError::Io { inner, .. })
                if matches!(
                    inner.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl FrameSink for FrameWriter<TcpStream> {
    fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.write(&frame)
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.get_ref().shutdown(Shutdown::Both) {
            debug!("tcp shutdown: {e}");
        }
    }
}

impl<R: Read + Send> FrameSource for FrameReader<R> {
    fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        self.read()
    }
}

/// In-process connection half backed by a channel.
pub(crate) struct MemorySink {
    sender: Option<mpsc::Sender<Frame>>,
}

pub(crate) struct MemorySource {
    receiver: mpsc::Receiver<Frame>,
}

/// Two connected in-process halves: frames written to one sink come out of the other source.
pub(crate) fn memory_pipe() -> ((MemorySource, MemorySink), (MemorySource, MemorySink)) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        (
            MemorySource { receiver: a_rx },
            MemorySink {
                sender: Some(b_tx),
            },
        ),
        (
            MemorySource { receiver: b_rx },
            MemorySink {
                sender: Some(a_tx),
            },
        ),
    )
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.sender = None;
    }
}

impl FrameSource for MemorySource {
    fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.receiver.recv().ok())
    }
}
