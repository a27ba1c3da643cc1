//! SCTP datagram mode.
//!
//! An SCTP socket is in datagram mode when it is buffered and its
//! `max_channel_count` is not negative. Each SCTP stream then becomes one
//! channel with its own message queue:
//!
//! - Incoming messages are reassembled from fragments until end-of-record
//!   and queued on the channel of the stream they arrived on.
//! - Outgoing messages are queued per channel and sent round-robin, one
//!   message per channel per pass.
//!
//! Otherwise the socket behaves like a TCP byte stream.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::engine::{SocketState, SocketType, Transfer};
use crate::error::{Result, SocketError, SocketErrorKind};
use crate::packet::{IpPacketHeader, NetworkDatagram, PacketHeaderOptions};
use crate::ring_buffer::RingBuffer;
use crate::socket::{AbstractSocket, SocketNotification};
use crate::telemetry::{record_metric, MetricsEvent};

const FRAGMENT_READ_SIZE: usize = 4096;

/// Per-channel buffers.
///
/// In packet mode every channel keeps one header per queued datagram, so
/// `headers[i].len() == buffers[i].chunk_count()` always holds.
#[derive(Debug, Clone)]
pub struct ChannelSet {
    buffers: Vec<RingBuffer>,
    headers: Vec<VecDeque<IpPacketHeader>>,
    packet_mode: bool,
}

impl ChannelSet {
    /// A set with one channel.
    pub fn new(packet_mode: bool) -> Self {
        let mut set = Self {
            buffers: Vec::new(),
            headers: Vec::new(),
            packet_mode,
        };
        set.resize(1);
        set
    }

    fn make_buffer(packet_mode: bool) -> RingBuffer {
        if packet_mode {
            RingBuffer::packets()
        } else {
            RingBuffer::default()
        }
    }

    pub fn is_packet_mode(&self) -> bool {
        self.packet_mode
    }

    /// Switch framing. Queued data is dropped when the mode changes.
    pub fn set_packet_mode(&mut self, packet_mode: bool) {
        if self.packet_mode == packet_mode {
            return;
        }
        self.packet_mode = packet_mode;
        let count = self.buffers.len();
        self.buffers.clear();
        self.headers.clear();
        self.resize(count);
    }

    /// Grow or shrink to `count` channels (at least one), keeping the data
    /// of channels that survive.
    pub fn resize(&mut self, count: usize) {
        let count = count.max(1);
        let packet_mode = self.packet_mode;
        self.buffers
            .resize_with(count, || Self::make_buffer(packet_mode));
        self.headers.resize_with(count, VecDeque::new);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn index(&self, channel: usize) -> usize {
        channel.min(self.buffers.len().saturating_sub(1))
    }

    pub fn buffer(&self, channel: usize) -> &RingBuffer {
        &self.buffers[self.index(channel)]
    }

    pub fn buffer_mut(&mut self, channel: usize) -> &mut RingBuffer {
        let index = self.index(channel);
        &mut self.buffers[index]
    }

    pub fn push_datagram(&mut self, channel: usize, data: &[u8], header: IpPacketHeader) {
        let index = self.index(channel);
        self.buffers[index].append(data);
        self.headers[index].push_back(header);
    }

    pub fn pop_datagram(&mut self, channel: usize) -> Option<NetworkDatagram> {
        let index = self.index(channel);
        let header = self.headers[index].pop_front()?;
        let data = self.buffers[index].read_chunk().unwrap_or_default();
        Some(NetworkDatagram::new(data, header))
    }

    pub fn front_header(&self, channel: usize) -> Option<&IpPacketHeader> {
        self.headers[self.index(channel)].front()
    }

    pub fn datagram_count(&self, channel: usize) -> usize {
        self.headers[self.index(channel)].len()
    }

    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(RingBuffer::len).sum()
    }

    /// True when no bytes and no datagrams, zero-length ones included, are queued.
    pub fn all_empty(&self) -> bool {
        self.buffers.iter().all(RingBuffer::is_empty) && self.headers.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        self.buffers.iter_mut().for_each(RingBuffer::clear);
        self.headers.iter_mut().for_each(VecDeque::clear);
    }
}

impl AbstractSocket {
    pub fn is_datagram_mode(&self) -> bool {
        self.socket_type == SocketType::Sctp && self.buffered && self.config.max_channel_count >= 0
    }

    pub fn max_channel_count(&self) -> i32 {
        self.config.max_channel_count
    }

    /// Choose stream mode (negative), association default (0) or an
    /// explicit channel cap. Only allowed while unconnected.
    pub fn set_max_channel_count(&mut self, count: i32) -> Result<()> {
        if self.state != SocketState::Unconnected {
            warn!(state = ?self.state, "max channel count can only change while unconnected");
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Channel count can only change while unconnected",
            ));
        }
        self.config.max_channel_count = count;
        let packet_mode = self.is_datagram_mode();
        self.read_channels.set_packet_mode(packet_mode);
        self.write_channels.set_packet_mode(packet_mode);
        Ok(())
    }

    /// Receive whole messages until the engine would block.
    ///
    /// Returns true when the current read channel got a message.
    pub(crate) fn read_datagrams_from_socket(&mut self) -> bool {
        let mut current_channel_read = false;
        loop {
            let Some(header) = self.receive_whole_message() else {
                return current_channel_read;
            };

            let stream = usize::try_from(header.stream_number).unwrap_or(0);
            if stream >= self.read_channel_count.max(1) {
                warn!(
                    stream = header.stream_number,
                    channels = self.read_channel_count,
                    "dropping message on unknown stream"
                );
                self.incoming.clear();
                continue;
            }

            let message = self.incoming.split();
            trace!(stream, bytes = message.len(), "message received");
            record_metric(MetricsEvent::DatagramReceived {
                bytes: message.len(),
            });
            self.read_channels.push_datagram(stream, &message, header);
            if stream == self.current_read_channel {
                current_channel_read = true;
            }
            self.emit_ready_read(stream);

            if self.state != SocketState::Connected {
                return current_channel_read;
            }
        }
    }

    /// Accumulate fragments into `incoming` until end-of-record.
    ///
    /// `None` when the engine would block (the partial message is kept) or
    /// failed (the socket is disconnected).
    fn receive_whole_message(&mut self) -> Option<IpPacketHeader> {
        loop {
            let engine = self.engine.as_mut()?;
            let available = match engine.bytes_available() {
                0 => FRAGMENT_READ_SIZE,
                n => n,
            };
            let offset = self.incoming.len();
            self.incoming.resize(offset + available, 0);

            let outcome =
                engine.read_datagram(&mut self.incoming[offset..], PacketHeaderOptions::ALL);
            match outcome {
                Ok(Transfer::Done((n, header))) if n > 0 => {
                    self.incoming.truncate(offset + n);
                    if header.end_of_record {
                        return Some(header);
                    }
                }
                Ok(Transfer::WouldBlock) => {
                    self.incoming.truncate(offset);
                    return None;
                }
                Ok(Transfer::Done(_)) => {
                    self.incoming.truncate(offset);
                    self.fail_datagram_read(SocketError::from_kind(
                        SocketErrorKind::RemoteHostClosed,
                    ));
                    return None;
                }
                Err(e) => {
                    self.incoming.truncate(offset);
                    self.fail_datagram_read(e);
                    return None;
                }
            }
        }
    }

    fn fail_datagram_read(&mut self, err: SocketError) {
        debug!(error = %err, "message receive failed");
        if let Some(engine) = self.engine.as_mut() {
            engine.close();
        }
        self.disconnect_from_host();
        self.emit_error(err);
    }

    /// Send one queued message from every non-empty channel per pass until
    /// the engine would block or all channels drain.
    pub(crate) fn write_datagrams_to_socket(&mut self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let mut written_any = false;
        'passes: loop {
            let mut transmitted = false;
            for channel in 0..self.write_channels.len() {
                let Some(header) = self.write_channels.front_header(channel).cloned() else {
                    continue;
                };
                let Some(engine) = self.engine.as_mut() else {
                    return written_any;
                };
                let data = self.write_channels.buffer(channel).front().unwrap_or_default();
                let sent = match engine.write_datagram(data, &header) {
                    Ok(Transfer::Done(n)) => n,
                    Ok(Transfer::WouldBlock) => break 'passes,
                    Err(e) => {
                        self.abort();
                        self.emit_error(e);
                        return false;
                    }
                };

                let _ = self.write_channels.pop_datagram(channel);
                record_metric(MetricsEvent::DatagramSent { bytes: sent });
                if channel == self.current_write_channel {
                    self.notify(SocketNotification::BytesWritten(sent));
                }
                self.notify(SocketNotification::ChannelBytesWritten {
                    channel,
                    bytes: sent,
                });
                transmitted = true;
                written_any = true;
            }
            if !transmitted {
                break;
            }
        }

        if self.write_channels.all_empty() {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_write_notification_enabled(false);
            }
        }
        if self.state == SocketState::Closing {
            self.disconnect_from_host();
        }
        written_any
    }

    /// Next message on the current read channel.
    pub fn read_datagram(&mut self) -> Option<NetworkDatagram> {
        if !self.is_datagram_mode() {
            warn!("read_datagram needs an SCTP socket in datagram mode");
            return None;
        }
        let datagram = self.read_channels.pop_datagram(self.current_read_channel);
        if datagram.is_some() {
            self.resume_reading();
        }
        datagram
    }

    /// Queue `datagram` on the current write channel.
    ///
    /// The stream number of the header is replaced by the channel index.
    pub fn write_datagram(&mut self, datagram: NetworkDatagram) -> Result<()> {
        if self.state != SocketState::Connected || !self.is_valid() || !self.is_datagram_mode() {
            warn!(state = ?self.state, "write_datagram is not permitted");
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Writing a datagram is not permitted in this state",
            ));
        }
        self.queue_datagram(&datagram.data, datagram.header)
    }

    pub(crate) fn queue_datagram(&mut self, data: &[u8], mut header: IpPacketHeader) -> Result<()> {
        let channel = self.current_write_channel;
        header.stream_number = i32::try_from(channel).unwrap_or(i32::MAX);
        self.write_channels.push_datagram(channel, data, header);
        if let Some(engine) = self.engine.as_mut() {
            engine.set_write_notification_enabled(true);
        }
        Ok(())
    }

    /// Generic read in datagram mode: one message, truncated to `buf`.
    pub(crate) fn read_datagram_into(&mut self, buf: &mut [u8]) -> usize {
        let Some(datagram) = self.read_channels.pop_datagram(self.current_read_channel) else {
            return 0;
        };
        let n = datagram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        if n < datagram.data.len() {
            trace!(dropped = datagram.data.len() - n, "message truncated by generic read");
        }
        self.resume_reading();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockeng_addr::HostAddress;

    #[test]
    fn test_channel_set_keeps_headers_in_step() {
        let mut set = ChannelSet::new(true);
        set.resize(3);
        let mut header = IpPacketHeader::to(HostAddress::parse("10.0.0.1").unwrap(), 9);
        header.stream_number = 2;
        set.push_datagram(2, b"first", header.clone());
        set.push_datagram(2, b"", header);
        assert_eq!(set.datagram_count(2), 2);
        assert_eq!(set.buffer(2).chunk_count(), 2);

        let first = set.pop_datagram(2).unwrap();
        assert_eq!(&first.data[..], b"first");
        assert_eq!(first.header.stream_number, 2);
        let empty = set.pop_datagram(2).unwrap();
        assert!(empty.data.is_empty());
        assert!(set.pop_datagram(2).is_none());
        assert!(set.all_empty());
    }

    #[test]
    fn test_zero_length_datagram_is_pending() {
        let mut set = ChannelSet::new(true);
        let header = IpPacketHeader::to(HostAddress::parse("10.0.0.1").unwrap(), 9);
        set.push_datagram(0, b"", header);
        assert_eq!(set.total_len(), 0);
        assert!(!set.all_empty());
        set.pop_datagram(0).unwrap();
        assert!(set.all_empty());
    }

    #[test]
    fn test_resize_keeps_existing_channels() {
        let mut set = ChannelSet::new(false);
        set.buffer_mut(0).append(b"kept");
        set.resize(4);
        assert_eq!(set.len(), 4);
        assert_eq!(set.buffer(0).len(), 4);
        set.resize(0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_len(), 4);
    }

    #[test]
    fn test_out_of_range_channel_maps_to_last() {
        let mut set = ChannelSet::new(true);
        set.resize(2);
        set.push_datagram(7, b"x", IpPacketHeader::default());
        assert_eq!(set.datagram_count(1), 1);
    }

    #[test]
    fn test_mode_switch_drops_data() {
        let mut set = ChannelSet::new(false);
        set.resize(2);
        set.buffer_mut(1).append(b"stream bytes");
        set.set_packet_mode(true);
        assert!(set.is_packet_mode());
        assert_eq!(set.len(), 2);
        assert!(set.all_empty());
    }

    #[test]
    fn test_datagram_mode_selection() {
        let mut socket = AbstractSocket::sctp();
        assert!(socket.is_datagram_mode());
        socket.set_max_channel_count(-1).unwrap();
        assert!(!socket.is_datagram_mode());
        socket.set_max_channel_count(4).unwrap();
        assert!(socket.is_datagram_mode());
        assert_eq!(socket.max_channel_count(), 4);

        assert!(!AbstractSocket::tcp().is_datagram_mode());
    }
}
