//! Linux SCTP socket API definitions (from `<netinet/sctp.h>`).
//!
//! `libc` does not carry these, so they are declared here the same way the
//! UDP offload constants are declared next to their users.

#![allow(non_camel_case_types)]

use libc::c_int;

pub const IPPROTO_SCTP: c_int = 132;
pub const SOL_SCTP: c_int = 132;

pub const SCTP_INITMSG: c_int = 2;
pub const SCTP_NODELAY: c_int = 3;
pub const SCTP_EVENTS: c_int = 11;
pub const SCTP_STATUS: c_int = 14;

/// Control message type carrying `sctp_sndrcvinfo`.
pub const SCTP_SNDRCV: c_int = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sctp_initmsg {
    pub sinit_num_ostreams: u16,
    pub sinit_max_instreams: u16,
    pub sinit_max_attempts: u16,
    pub sinit_max_init_timeo: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sctp_sndrcvinfo {
    pub sinfo_stream: u16,
    pub sinfo_ssn: u16,
    pub sinfo_flags: u16,
    pub sinfo_ppid: u32,
    pub sinfo_context: u32,
    pub sinfo_timetolive: u32,
    pub sinfo_tsn: u32,
    pub sinfo_cumtsn: u32,
    pub sinfo_assoc_id: i32,
}

/// Event subscription flags, one byte each.
///
/// Only the fields present since the earliest supported kernels are
/// declared; the kernel accepts a shorter option length.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sctp_event_subscribe {
    pub sctp_data_io_event: u8,
    pub sctp_association_event: u8,
    pub sctp_address_event: u8,
    pub sctp_send_failure_event: u8,
    pub sctp_peer_error_event: u8,
    pub sctp_shutdown_event: u8,
    pub sctp_partial_delivery_event: u8,
    pub sctp_adaptation_layer_event: u8,
    pub sctp_authentication_event: u8,
    pub sctp_sender_dry_event: u8,
}

/// Packed `sctp_paddrinfo` (assoc id, sockaddr_storage, state, cwnd, srtt,
/// rto, mtu) kept opaque.
pub const SCTP_PADDRINFO_SIZE: usize = 4 + 128 + 5 * 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct sctp_status {
    pub sstat_assoc_id: i32,
    pub sstat_state: i32,
    pub sstat_rwnd: u32,
    pub sstat_unackdata: u16,
    pub sstat_penddata: u16,
    pub sstat_instrms: u16,
    pub sstat_outstrms: u16,
    pub sstat_fragmentation_point: u32,
    pub sstat_primary: [u8; SCTP_PADDRINFO_SIZE],
}

impl Default for sctp_status {
    fn default() -> Self {
        Self {
            sstat_assoc_id: 0,
            sstat_state: 0,
            sstat_rwnd: 0,
            sstat_unackdata: 0,
            sstat_penddata: 0,
            sstat_instrms: 0,
            sstat_outstrms: 0,
            sstat_fragmentation_point: 0,
            sstat_primary: [0; SCTP_PADDRINFO_SIZE],
        }
    }
}
