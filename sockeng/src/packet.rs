//! Per-datagram metadata.

use bitflags::bitflags;
use bytes::Bytes;
use sockeng_addr::HostAddress;

/// Metadata attached to one datagram on send or receive.
///
/// Fields that the OS did not report stay at their sentinels: hop limit `-1`,
/// interface index `0`, stream number `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacketHeader {
    pub sender_address: HostAddress,
    pub sender_port: u16,
    pub destination_address: HostAddress,
    pub destination_port: u16,
    pub hop_limit: i32,
    pub ifindex: u32,
    /// SCTP stream the message travels on.
    pub stream_number: i32,
    /// Set when the receive completed an SCTP message.
    pub end_of_record: bool,
}

impl Default for IpPacketHeader {
    fn default() -> Self {
        Self {
            sender_address: HostAddress::null(),
            sender_port: 0,
            destination_address: HostAddress::null(),
            destination_port: 0,
            hop_limit: -1,
            ifindex: 0,
            stream_number: -1,
            end_of_record: false,
        }
    }
}

impl IpPacketHeader {
    /// Header addressed to `address:port` with everything else unset.
    pub fn to(address: HostAddress, port: u16) -> Self {
        Self {
            destination_address: address,
            destination_port: port,
            ..Self::default()
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

bitflags! {
    /// Which header fields a datagram receive should fill in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketHeaderOptions: u8 {
        const SENDER = 0x01;
        const DESTINATION = 0x02;
        const HOP_LIMIT = 0x04;
        const STREAM_NUMBER = 0x08;
        const END_OF_RECORD = 0x10;
        const ALL = 0xff;
    }
}

impl PacketHeaderOptions {
    pub const NONE: Self = Self::empty();

    /// Fields that come from ancillary data rather than the message name.
    pub fn wants_control_data(self) -> bool {
        self.intersects(Self::DESTINATION | Self::HOP_LIMIT | Self::STREAM_NUMBER)
    }
}

/// A datagram and its header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDatagram {
    pub data: Bytes,
    pub header: IpPacketHeader,
}

impl NetworkDatagram {
    pub fn new(data: impl Into<Bytes>, header: IpPacketHeader) -> Self {
        Self {
            data: data.into(),
            header,
        }
    }

    /// A datagram is null when it carries neither payload nor addressing.
    pub fn is_null(&self) -> bool {
        self.data.is_empty()
            && self.header.sender_address.is_null()
            && self.header.destination_address.is_null()
    }
}
