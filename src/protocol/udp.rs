//! UDP protocol - RFC 768
//!
//! Header parsing and checksum calculation for the rewrite path. A stored
//! checksum of zero means "not computed" and must survive rewrites.

use super::checksum::{fold16, sum_words};
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// UDP header size (fixed)
pub const HEADER_SIZE: usize = 8;

/// UDP protocol number for pseudo-header
pub const PROTOCOL_NUMBER: u8 = 17;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    /// Parse UDP header from buffer
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }

        Ok(Self { buffer })
    }

    /// Source port (offset 0-1)
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    /// Destination port (offset 2-3)
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Length (header + data) (offset 4-5)
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// Checksum (offset 6-7); 0 means checksum not computed
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// Payload (data after header)
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }

    /// Validate checksum with pseudo-header.
    ///
    /// A zero checksum is accepted as "not computed".
    pub fn validate_checksum(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        fold16(pseudo_header_sum(src_ip, dst_ip, self.buffer).wrapping_add(sum_words(self.buffer)))
            == 0xFFFF
    }
}

/// Mutable UDP header view for in-place rewrites
#[derive(Debug)]
pub struct UdpHeaderMut<'a> {
    buffer: &'a mut [u8],
}

impl<'a> UdpHeaderMut<'a> {
    /// Wrap a datagram already validated by [`UdpHeader::parse`].
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer }
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.buffer[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.buffer[6..8].copy_from_slice(&checksum.to_be_bytes());
    }
}

fn pseudo_header_sum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, datagram: &[u8]) -> u32 {
    let src = src_ip.octets();
    let dst = dst_ip.octets();

    u16::from_be_bytes([src[0], src[1]]) as u32
        + u16::from_be_bytes([src[2], src[3]]) as u32
        + u16::from_be_bytes([dst[0], dst[1]]) as u32
        + u16::from_be_bytes([dst[2], dst[3]]) as u32
        + PROTOCOL_NUMBER as u32
        + datagram.len() as u32
}

/// Calculate UDP checksum with pseudo-header (RFC 768)
///
/// Returns 0xFFFF when the arithmetic lands on zero: on the wire, zero is
/// reserved for "no checksum".
pub fn udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, datagram: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_ip, dst_ip, datagram).wrapping_add(sum_words(datagram));
    match !fold16(sum) {
        0 => 0xFFFF,
        c => c,
    }
}
