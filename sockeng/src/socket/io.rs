//! Buffered reads and writes, channel selection and UDP pass-through.

use bytes::{Bytes, BytesMut};
use sockeng_addr::{HostAddress, SpecialAddress};
use tracing::{debug, trace, warn};

use super::{AbstractSocket, BindMode, SocketNotification, Step};
use crate::engine::{NetworkInterface, SocketState, SocketType, Transfer};
use crate::error::{Result, SocketError, SocketErrorKind};
use crate::packet::{IpPacketHeader, NetworkDatagram, PacketHeaderOptions};
use crate::telemetry::{record_metric, MetricsEvent};

/// Read size used when the engine cannot tell how much is queued.
pub(crate) const DEFAULT_READ_CHUNK: usize = 4096;

impl AbstractSocket {
    // ========================================================================
    // Readiness handling
    // ========================================================================

    /// Returns true when new data became available to the owner.
    pub(super) fn on_readable(&mut self) -> bool {
        match self.state {
            SocketState::Connecting => {
                self.on_connection_notification();
                false
            }
            SocketState::Connected | SocketState::Bound => self.can_read_notification(),
            _ => false,
        }
    }

    /// Returns true when queued data reached the engine.
    pub(super) fn on_writable(&mut self) -> bool {
        match self.state {
            SocketState::Connecting => {
                self.on_connection_notification();
                false
            }
            SocketState::Connected | SocketState::Closing => self.write_to_socket(),
            _ => false,
        }
    }

    fn can_read_notification(&mut self) -> bool {
        if self.is_datagram_mode() {
            return self.read_datagrams_from_socket();
        }

        if !self.buffered {
            if self.has_pending_data {
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_read_notification_enabled(false);
                }
                return true;
            }
            self.has_pending_data = true;
            self.emit_ready_read(0);
            return true;
        }

        let before = self.read_channels.buffer(0).len();
        if self.read_buffer_max_size > 0 && before >= self.read_buffer_max_size {
            trace!(buffered = before, "read buffer full, pausing read notifications");
            if let Some(engine) = self.engine.as_mut() {
                engine.set_read_notification_enabled(false);
            }
            return false;
        }

        if let Err(e) = self.read_from_socket() {
            self.run(Step::Disconnect);
            self.emit_error(e);
            return false;
        }
        if self.read_channels.buffer(0).len() == before {
            return false;
        }
        self.emit_ready_read(0);
        true
    }

    /// Pull what the engine has into the stream buffer.
    ///
    /// On failure the engine is already dropped; the caller reports the
    /// error once the socket has left the connected state.
    fn read_from_socket(&mut self) -> Result<()> {
        let buffered = self.read_channels.buffer(0).len();
        let cap = self.read_buffer_max_size;
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };

        let mut to_read = match engine.bytes_available() {
            0 => DEFAULT_READ_CHUNK,
            n => n,
        };
        if cap > 0 {
            to_read = to_read.min(cap.saturating_sub(buffered));
        }
        let mut chunk = BytesMut::zeroed(to_read);

        match engine.read(&mut chunk) {
            Ok(Transfer::WouldBlock) => Ok(()),
            Ok(Transfer::Done(n)) => {
                if n > 0 {
                    chunk.truncate(n);
                    self.read_channels.buffer_mut(0).append(&chunk);
                    record_metric(MetricsEvent::BytesRead { bytes: n });
                    trace!(bytes = n, "buffered incoming data");
                }
                if !self.is_valid() {
                    let err = self.engine_error();
                    self.reset_socket_layer();
                    return Err(err);
                }
                Ok(())
            }
            Err(e) => {
                self.reset_socket_layer();
                Err(e)
            }
        }
    }

    pub(crate) fn emit_ready_read(&mut self, channel: usize) {
        if channel == self.current_read_channel
            && !self.notifications.contains(&SocketNotification::ReadyRead)
        {
            self.notify(SocketNotification::ReadyRead);
        }
        self.notify(SocketNotification::ChannelReadyRead(channel));
    }

    /// Write the next block of the current write channel.
    pub(crate) fn write_to_socket(&mut self) -> bool {
        if self.is_datagram_mode() {
            return self.write_datagrams_to_socket();
        }

        let channel = self.current_write_channel;
        let writable_state = matches!(self.state, SocketState::Connected | SocketState::Closing);
        let engine_pending = self.engine.as_ref().map_or(0, |e| e.bytes_to_write());
        if !self.is_valid()
            || !writable_state
            || (self.write_channels.buffer(channel).is_empty() && engine_pending == 0)
        {
            if self.write_channels.buffer(channel).is_empty() && engine_pending == 0 {
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_write_notification_enabled(false);
                }
            }
            if self.state == SocketState::Closing {
                self.run(Step::Disconnect);
            }
            return false;
        }

        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        let block = self.write_channels.buffer(channel).front().unwrap_or_default();
        let outcome = if block.is_empty() {
            Ok(Transfer::Done(0))
        } else {
            engine.write(block)
        };
        let written = match outcome {
            Ok(Transfer::Done(n)) => n,
            Ok(Transfer::WouldBlock) => 0,
            Err(e) => {
                self.abort();
                self.emit_error(e);
                return false;
            }
        };

        self.write_channels.buffer_mut(channel).free(written);
        if written > 0 {
            record_metric(MetricsEvent::BytesWritten { bytes: written });
            self.notify(SocketNotification::BytesWritten(written));
            self.notify(SocketNotification::ChannelBytesWritten {
                channel,
                bytes: written,
            });
        }

        let drained = self.write_channels.buffer(channel).is_empty();
        if let Some(engine) = self.engine.as_mut() {
            if drained && engine.bytes_to_write() == 0 {
                engine.set_write_notification_enabled(false);
            }
        }
        if self.state == SocketState::Closing {
            self.run(Step::Disconnect);
        }
        written > 0
    }

    /// Re-enable read notifications once the buffers have room again.
    pub(crate) fn resume_reading(&mut self) {
        if !matches!(self.state, SocketState::Connected | SocketState::Bound) {
            return;
        }
        let cap = self.read_buffer_max_size;
        let buffered = self.read_channels.total_len();
        if let Some(engine) = self.engine.as_mut() {
            if engine.is_valid()
                && !engine.is_read_notification_enabled()
                && (cap == 0 || buffered < cap)
            {
                engine.set_read_notification_enabled(true);
            }
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Read into `buf`, returning how many bytes were copied.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.is_datagram_mode() {
            return Ok(self.read_datagram_into(buf));
        }
        let mut n = self
            .read_channels
            .buffer_mut(self.current_read_channel)
            .read_into(buf);
        if !self.buffered && n < buf.len() {
            n += self.read_unbuffered(&mut buf[n..])?;
        }
        self.resume_reading();
        Ok(n)
    }

    fn read_unbuffered(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(engine) = self.engine.as_mut().filter(|e| e.is_valid()) else {
            return Ok(0);
        };
        let outcome = engine.read(buf);
        self.has_pending_data = false;
        match outcome {
            Ok(transfer) => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_read_notification_enabled(true);
                }
                let n = transfer.done().unwrap_or(0);
                if n > 0 {
                    record_metric(MetricsEvent::BytesRead { bytes: n });
                }
                Ok(n)
            }
            Err(e) => {
                self.reset_socket_layer();
                self.set_state(SocketState::Unconnected);
                self.emit_error(e.clone());
                Err(e)
            }
        }
    }

    /// Everything currently readable on the current channel.
    pub fn read_all(&mut self) -> Result<Bytes> {
        if self.is_datagram_mode() {
            let mut all = BytesMut::new();
            while let Some(datagram) = self.read_datagram() {
                all.extend_from_slice(&datagram.data);
            }
            return Ok(all.freeze());
        }

        let buffer = self.read_channels.buffer_mut(self.current_read_channel);
        let mut all = BytesMut::zeroed(buffer.len());
        let n = buffer.read_into(&mut all);
        all.truncate(n);

        if !self.buffered {
            let mut chunk = [0u8; DEFAULT_READ_CHUNK];
            loop {
                let n = self.read_unbuffered(&mut chunk)?;
                if n == 0 {
                    break;
                }
                all.extend_from_slice(&chunk[..n]);
            }
        }
        self.resume_reading();
        Ok(all.freeze())
    }

    /// Read through the next `\n` or up to `max_len` bytes.
    pub fn read_line(&mut self, max_len: usize) -> Result<Bytes> {
        if self.is_datagram_mode() {
            let mut line = BytesMut::zeroed(max_len);
            let n = self.read_datagram_into(&mut line);
            line.truncate(n);
            return Ok(line.freeze());
        }
        if self.buffered {
            let line = self
                .read_channels
                .buffer_mut(self.current_read_channel)
                .read_line(max_len);
            self.resume_reading();
            return Ok(line);
        }

        let mut line = BytesMut::new();
        let mut byte = [0u8; 1];
        while line.len() < max_len {
            if self.read(&mut byte)? == 0 {
                break;
            }
            line.extend_from_slice(&byte);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(line.freeze())
    }

    pub fn can_read_line(&self) -> bool {
        self.read_channels
            .buffer(self.current_read_channel)
            .can_read_line()
    }

    /// Copy buffered bytes without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.read_channels
            .buffer(self.current_read_channel)
            .peek(buf)
    }

    pub fn bytes_available(&self) -> usize {
        let mut available = self.read_channels.buffer(self.current_read_channel).len();
        if !self.buffered {
            if let Some(engine) = self.engine.as_ref().filter(|e| e.is_valid()) {
                available += engine.bytes_available();
            }
        }
        available
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Queue `data` for sending. Returns how many bytes were accepted.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.state == SocketState::Unconnected || (self.engine.is_none() && !self.buffered) {
            let err = SocketError::new(SocketErrorKind::Unknown, "Socket is not connected");
            self.set_error(err.clone());
            return Err(err);
        }
        if self.is_datagram_mode() {
            self.queue_datagram(data, IpPacketHeader::default())?;
            return Ok(data.len());
        }
        if !self.buffered {
            return self.write_unbuffered(data);
        }

        self.write_channels
            .buffer_mut(self.current_write_channel)
            .append(data);
        if let Some(engine) = self.engine.as_mut() {
            engine.set_write_notification_enabled(true);
        }
        trace!(bytes = data.len(), queued = self.bytes_to_write(), "write queued");
        Ok(data.len())
    }

    fn write_unbuffered(&mut self, data: &[u8]) -> Result<usize> {
        let is_tcp = self.socket_type == SocketType::Tcp;
        let channel = self.current_write_channel;
        let direct = !is_tcp
            || (self.state == SocketState::Connected && self.write_channels.all_empty());

        if !direct {
            self.write_channels.buffer_mut(channel).append(data);
            if let Some(engine) = self.engine.as_mut() {
                engine.set_write_notification_enabled(true);
            }
            return Ok(data.len());
        }

        let Some(engine) = self.engine.as_mut() else {
            return Err(SocketError::new(
                SocketErrorKind::Unknown,
                "Socket is not connected",
            ));
        };
        let written = match engine.write(data) {
            Ok(transfer) => transfer.done().unwrap_or(0),
            Err(e) => {
                self.emit_error(e.clone());
                return Err(e);
            }
        };
        if written > 0 {
            record_metric(MetricsEvent::BytesWritten { bytes: written });
        }

        if is_tcp {
            if written < data.len() {
                self.write_channels
                    .buffer_mut(channel)
                    .append(&data[written..]);
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_write_notification_enabled(true);
                }
            }
            return Ok(data.len());
        }

        self.notify(SocketNotification::BytesWritten(written));
        Ok(written)
    }

    /// Write as much queued data as the engine takes without blocking.
    pub fn flush(&mut self) -> bool {
        let mut written = false;
        while !self.write_channels.all_empty() && self.write_to_socket() {
            written = true;
        }
        written
    }

    pub fn bytes_to_write(&self) -> usize {
        let engine_pending = self.engine.as_ref().map_or(0, |e| e.bytes_to_write());
        self.write_channels
            .buffer(self.current_write_channel)
            .len()
            + engine_pending
    }

    // ========================================================================
    // Channels and buffer limits
    // ========================================================================

    pub fn read_channel_count(&self) -> usize {
        self.read_channel_count
    }

    pub fn write_channel_count(&self) -> usize {
        self.write_channel_count
    }

    pub fn current_read_channel(&self) -> usize {
        self.current_read_channel
    }

    pub fn current_write_channel(&self) -> usize {
        self.current_write_channel
    }

    pub fn set_current_read_channel(&mut self, channel: usize) -> Result<()> {
        if channel < self.read_channel_count.max(1) {
            self.current_read_channel = channel;
            return Ok(());
        }
        warn!(channel, count = self.read_channel_count, "read channel out of range");
        Err(SocketError::new(
            SocketErrorKind::OperationError,
            format!("Read channel {} out of range", channel),
        ))
    }

    pub fn set_current_write_channel(&mut self, channel: usize) -> Result<()> {
        if channel < self.write_channel_count.max(1) {
            self.current_write_channel = channel;
            return Ok(());
        }
        warn!(channel, count = self.write_channel_count, "write channel out of range");
        Err(SocketError::new(
            SocketErrorKind::OperationError,
            format!("Write channel {} out of range", channel),
        ))
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_max_size
    }

    /// Cap buffered incoming data at `size` bytes; 0 removes the cap.
    pub fn set_read_buffer_size(&mut self, size: usize) {
        if self.read_buffer_max_size == size {
            return;
        }
        self.read_buffer_max_size = size;
        if self.state == SocketState::Connected {
            let buffered = self.read_channels.total_len();
            if let Some(engine) = self.engine.as_mut() {
                engine.set_read_notification_enabled(size == 0 || buffered < size);
            }
        }
    }

    // ========================================================================
    // UDP pass-through
    // ========================================================================

    pub fn has_pending_datagrams(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|e| e.is_valid() && e.has_pending_datagrams())
    }

    pub fn pending_datagram_size(&self) -> Option<usize> {
        self.engine
            .as_ref()
            .filter(|e| e.is_valid())
            .and_then(|e| e.pending_datagram_size())
    }

    /// Receive one datagram of at most `max_size` bytes, or of its full size
    /// when `max_size` is `None`. `Ok(None)` means nothing was queued.
    pub fn receive_datagram(&mut self, max_size: Option<usize>) -> Result<Option<NetworkDatagram>> {
        if !matches!(self.state, SocketState::Bound | SocketState::Connected) {
            warn!(state = ?self.state, "receive_datagram called on a socket that is not bound or connected");
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Socket is not bound or connected",
            ));
        }
        let Some(engine) = self.engine.as_mut().filter(|e| e.is_valid()) else {
            return Err(SocketError::from_kind(SocketErrorKind::OperationError));
        };
        let size = match max_size.or_else(|| engine.pending_datagram_size()) {
            Some(size) => size,
            None => return Ok(None),
        };

        let mut data = BytesMut::zeroed(size);
        let outcome = engine.read_datagram(&mut data, PacketHeaderOptions::ALL);
        self.has_pending_data = false;
        engine.set_read_notification_enabled(true);

        match outcome {
            Ok(Transfer::Done((n, header))) => {
                data.truncate(n);
                record_metric(MetricsEvent::DatagramReceived { bytes: n });
                Ok(Some(NetworkDatagram::new(data.freeze(), header)))
            }
            Ok(Transfer::WouldBlock) => Ok(None),
            Err(e) => {
                self.emit_error(e.clone());
                Err(e)
            }
        }
    }

    /// Send `data` to the destination in `header`, binding to the wildcard
    /// address first if the socket is not bound yet.
    pub fn send_datagram(&mut self, data: &[u8], header: &IpPacketHeader) -> Result<usize> {
        if self.state == SocketState::Unconnected {
            debug!("binding implicitly before sending a datagram");
            self.bind(
                &HostAddress::from(SpecialAddress::Any),
                0,
                BindMode::DEFAULT_FOR_PLATFORM,
            )?;
        }
        let Some(engine) = self.engine.as_mut().filter(|e| e.is_valid()) else {
            return Err(SocketError::from_kind(SocketErrorKind::OperationError));
        };
        match engine.write_datagram(data, header) {
            Ok(Transfer::Done(n)) => {
                record_metric(MetricsEvent::DatagramSent { bytes: n });
                self.notify(SocketNotification::BytesWritten(n));
                Ok(n)
            }
            Ok(Transfer::WouldBlock) => {
                let err = SocketError::new(
                    SocketErrorKind::TemporaryError,
                    "Unable to send a datagram",
                );
                self.set_error(err.clone());
                Err(err)
            }
            Err(e) => {
                self.emit_error(e.clone());
                Err(e)
            }
        }
    }

    pub fn join_multicast_group(
        &mut self,
        group: &HostAddress,
        iface: &NetworkInterface,
    ) -> Result<()> {
        self.multicast_membership(group, iface, true)
    }

    pub fn leave_multicast_group(
        &mut self,
        group: &HostAddress,
        iface: &NetworkInterface,
    ) -> Result<()> {
        self.multicast_membership(group, iface, false)
    }

    fn multicast_membership(
        &mut self,
        group: &HostAddress,
        iface: &NetworkInterface,
        join: bool,
    ) -> Result<()> {
        if self.state != SocketState::Bound {
            warn!(state = ?self.state, "multicast membership needs a bound socket");
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Socket is not bound",
            ));
        }
        let Some(engine) = self.engine.as_mut() else {
            return Err(SocketError::from_kind(SocketErrorKind::OperationError));
        };
        let result = if join {
            engine.join_multicast_group(group, iface)
        } else {
            engine.leave_multicast_group(group, iface)
        };
        if let Err(e) = &result {
            self.set_error(e.clone());
        }
        result
    }
}
