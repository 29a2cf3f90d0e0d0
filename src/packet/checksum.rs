//! Internet checksum (RFC 1071)

use std::net::IpAddr;

/// Add `data` as big-endian 16-bit words to `sum`. An odd trailing byte is
/// padded with zero.
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries and take the one's complement.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finish(sum_words(header, 0))
}

fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, len: usize) -> u32 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
            sum = sum.wrapping_add(protocol as u32);
            sum = sum.wrapping_add(len as u32);
        }
        _ => {
            let s = match src {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let d = match dst {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
            sum = sum_words(&(len as u32).to_be_bytes(), sum);
            sum = sum.wrapping_add(protocol as u32);
        }
    }
    sum
}

/// TCP/UDP checksum over the pseudo header and `segment` (whose checksum
/// field must be zero).
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len());
    finish(sum_words(segment, sum))
}
