//! Generic WebSocket protocol engine.
//!
//! [`WireCodec`] is a sans-io state machine: inbound bytes go in through
//! [`WireCodec::receive_bytes`] and come out as [`WireEvent`]s, outbound
//! messages and control frames are encoded to raw bytes for the caller to
//! write. The connection layer owns the socket and the task structure.

pub mod frame;

mod message;

pub use self::frame::coding::CloseCode;
pub use self::frame::CloseFrame;
pub use self::message::Message;

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use log::*;

use self::frame::coding::{Control, Data, OpCode};
use self::frame::{Frame, FrameHeader};
use self::message::{AssemblyKind, MessageAssembly};
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// Indicates a client or server role of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side is a server.
    Server,
    /// This side is a client.
    Client,
}

/// Maximum size of an assembled incoming message (64 MiB).
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// An event produced by feeding inbound bytes to the codec.
#[derive(Debug)]
pub(crate) enum WireEvent {
    /// A complete data message.
    Message(Message),
    /// A ping that must be answered with a pong carrying the same payload.
    Ping(Vec<u8>),
    /// A pong, solicited or not.
    Pong(Vec<u8>),
    /// The peer sent a close frame.
    Close(Option<CloseFrame>),
}

/// A codec turning raw bytes into WebSocket events and vice versa.
#[derive(Debug)]
pub(crate) struct WireCodec {
    role: Role,
    in_buffer: BytesMut,
    /// Header and payload size of the frame currently being received.
    header: Option<(FrameHeader, u64)>,
    /// A fragmented message being reassembled.
    incomplete: Option<MessageAssembly>,
    max_message_size: usize,
    /// The peer sent a close frame; data frames are ignored from then on.
    remote_closed: bool,
}

impl WireCodec {
    /// Create a codec for the given role. `leftover` holds any bytes that
    /// were read past the end of the handshake response.
    pub(crate) fn new(role: Role, leftover: Vec<u8>) -> Self {
        WireCodec {
            role,
            in_buffer: BytesMut::from(&leftover[..]),
            header: None,
            incomplete: None,
            max_message_size: MAX_MESSAGE_SIZE,
            remote_closed: false,
        }
    }

    /// Feed inbound bytes and append every event that completes to `events`,
    /// preserving wire order.
    pub(crate) fn receive_bytes(&mut self, data: &[u8], events: &mut Vec<WireEvent>) -> Result<()> {
        self.in_buffer.extend_from_slice(data);
        while let Some(frame) = self.next_frame()? {
            trace!("received frame {frame}");
            if let Some(event) = self.handle_frame(frame)? {
                events.push(event);
            }
        }
        Ok(())
    }

    /// Decode one frame out of the input buffer, or `None` if more bytes are
    /// needed.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.header.is_none() {
            let mut cursor = Cursor::new(&self.in_buffer[..]);
            match FrameHeader::parse(&mut cursor)? {
                Some((header, length)) => {
                    if length > self.max_message_size as u64 {
                        return Err(Error::Capacity(CapacityError::MessageTooLong {
                            size: length as usize,
                            max_size: self.max_message_size,
                        }));
                    }
                    let consumed = cursor.position() as usize;
                    self.in_buffer.advance(consumed);
                    self.header = Some((header, length));
                }
                None => return Ok(None),
            }
        }

        // Length fits in usize, checked against max_message_size above.
        let length = self.header.as_ref().map(|&(_, length)| length as usize);
        match length {
            Some(length) if self.in_buffer.len() >= length => {
                let (header, _) = self.header.take().expect("Bug: no frame header");
                let payload = self.in_buffer.split_to(length).freeze();
                Ok(Some(Frame::from_payload(header, payload)))
            }
            _ => Ok(None),
        }
    }

    fn handle_frame(&mut self, mut frame: Frame) -> Result<Option<WireEvent>> {
        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values. (RFC 6455)
        if frame.header().rsv1 || frame.header().rsv2 || frame.header().rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }

        match self.role {
            Role::Server => {
                if frame.is_masked() {
                    // A server MUST remove masking for data frames received
                    // from a client. (RFC 6455)
                    frame.remove_mask();
                } else {
                    return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
                }
            }
            Role::Client => {
                if frame.is_masked() {
                    // A client MUST close a connection if it detects a masked
                    // frame. (RFC 6455)
                    return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
                }
            }
        }

        match frame.header().opcode {
            OpCode::Control(ctl) => {
                match ctl {
                    // All control frames MUST have a payload length of 125
                    // bytes or less and MUST NOT be fragmented. (RFC 6455)
                    _ if !frame.header().is_final => {
                        Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
                    }
                    _ if frame.payload().len() > 125 => {
                        Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
                    }
                    Control::Close => {
                        self.remote_closed = true;
                        Ok(Some(WireEvent::Close(frame.into_close()?)))
                    }
                    Control::Reserved(i) => {
                        Err(Error::Protocol(ProtocolError::UnknownControlFrameType(i)))
                    }
                    Control::Ping => Ok(Some(WireEvent::Ping(frame.into_payload().to_vec()))),
                    Control::Pong => Ok(Some(WireEvent::Pong(frame.into_payload().to_vec()))),
                }
            }

            OpCode::Data(_) if self.remote_closed => {
                // No data processing while closing.
                Ok(None)
            }

            OpCode::Data(data) => {
                let fin = frame.header().is_final;
                match data {
                    Data::Continue => {
                        if let Some(ref mut incomplete) = self.incomplete {
                            incomplete.extend(frame.payload(), self.max_message_size)?;
                        } else {
                            return Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame));
                        }
                        if fin {
                            let incomplete =
                                self.incomplete.take().expect("Bug: no incomplete message");
                            Ok(Some(WireEvent::Message(incomplete.complete()?)))
                        } else {
                            Ok(None)
                        }
                    }
                    c if self.incomplete.is_some() => {
                        Err(Error::Protocol(ProtocolError::ExpectedFragment(c)))
                    }
                    Data::Text | Data::Binary => {
                        let kind = match data {
                            Data::Text => AssemblyKind::Text,
                            _ => AssemblyKind::Binary,
                        };
                        let mut assembly = MessageAssembly::new(kind);
                        assembly.extend(frame.payload(), self.max_message_size)?;
                        if fin {
                            Ok(Some(WireEvent::Message(assembly.complete()?)))
                        } else {
                            self.incomplete = Some(assembly);
                            Ok(None)
                        }
                    }
                    Data::Reserved(i) => {
                        Err(Error::Protocol(ProtocolError::UnknownDataFrameType(i)))
                    }
                }
            }
        }
    }

}

/// The encode half of the codec. Unlike decoding it is stateless: only the
/// role matters, for the masking direction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameEncoder {
    role: Role,
}

impl FrameEncoder {
    pub(crate) fn new(role: Role) -> Self {
        FrameEncoder { role }
    }

    /// Encode one outgoing data frame.
    pub(crate) fn encode_message(&self, message: Message, out: &mut Vec<u8>) {
        let frame = match message {
            Message::Text(data) => Frame::message(data.into_bytes(), OpCode::Data(Data::Text), true),
            Message::Binary(data) => Frame::message(data, OpCode::Data(Data::Binary), true),
        };
        self.encode_frame(frame, out);
    }

    /// Encode an outgoing ping frame.
    pub(crate) fn encode_ping(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if payload.len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.encode_frame(Frame::ping(payload.to_vec()), out);
        Ok(())
    }

    /// Encode an outgoing pong frame.
    pub(crate) fn encode_pong(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if payload.len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.encode_frame(Frame::pong(payload.to_vec()), out);
        Ok(())
    }

    /// Encode an outgoing close frame.
    ///
    /// Codes that may not appear on the wire (1005, 1006, ...) are encoded
    /// as a bare close frame.
    pub(crate) fn encode_close(&self, close: Option<CloseFrame>, out: &mut Vec<u8>) -> Result<()> {
        let close = close.filter(|frame| frame.code.is_allowed());
        if let Some(ref frame) = close {
            if frame.reason.as_ref().map_or(0, String::len) + 2 > 125 {
                return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
            }
        }
        self.encode_frame(Frame::close(close), out);
        Ok(())
    }

    fn encode_frame(&self, mut frame: Frame, out: &mut Vec<u8>) {
        if let Role::Client = self.role {
            // If the data is being sent by the client, the frame(s) MUST be
            // masked as defined in Section 5.3. (RFC 6455)
            frame.set_random_mask();
        }
        trace!("writing frame {frame}");
        frame.format_into(out);
    }
}
