// MIT License - Copyright (c) 2026 Peter Wright
// Kocom frame codec

use tracing::trace;

use crate::constants::{
    FOOTER, FRAME_LEN, HEADER, OFFSET_CHECKSUM, OFFSET_COMMAND, OFFSET_DST, OFFSET_FOOTER,
    OFFSET_MONITOR, OFFSET_PREFIX, OFFSET_SRC, OFFSET_TYPE, OFFSET_VALUE, VALUE_LEN,
};
use crate::error::FrameError;
use crate::packet::{Command, DeviceAddress, Packet, hex_bytes};

/// Outcome of one decode attempt over a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, checksum-valid frame.
    Packet(Packet),
    /// Not enough bytes buffered for a full frame; read more and try again.
    Incomplete,
    /// A start marker was found but the frame behind it is corrupt.
    Invalid(FrameError),
}

/// Checksum of a frame: the byte sum of offsets 2..18, modulo 256.
pub fn checksum(frame: &[u8]) -> u8 {
    frame[OFFSET_PREFIX..OFFSET_CHECKSUM]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encode a packet into its 21-byte wire form. The checksum is always recomputed.
pub fn encode(packet: &Packet) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..2].copy_from_slice(&HEADER);
    frame[OFFSET_PREFIX] = packet.prefix;
    frame[OFFSET_TYPE] = packet.type_byte();
    frame[OFFSET_MONITOR] = packet.monitor;
    frame[OFFSET_DST..OFFSET_DST + 2].copy_from_slice(&packet.dst.to_bytes());
    frame[OFFSET_SRC..OFFSET_SRC + 2].copy_from_slice(&packet.src.to_bytes());
    frame[OFFSET_COMMAND] = packet.command.code();
    frame[OFFSET_VALUE..OFFSET_VALUE + VALUE_LEN].copy_from_slice(&packet.value);
    frame[OFFSET_CHECKSUM] = checksum(&frame);
    frame[OFFSET_FOOTER..].copy_from_slice(&FOOTER);
    frame
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns the outcome and how many bytes the caller should drop from the front
/// of its buffer:
/// - no start marker: everything is garbage and is consumed, except a trailing
///   `AA` that may be the first half of a marker still in flight;
/// - a marker with fewer than 21 bytes behind it: `Incomplete`, consuming the
///   garbage before the marker;
/// - a corrupt frame: `Invalid`, consuming up to one byte past the marker so
///   the next scan resynchronizes on a later marker;
/// - otherwise the packet and everything through its trailer.
pub fn decode(buf: &[u8]) -> (Decoded, usize) {
    let Some(start) = find_header(buf) else {
        let keep = usize::from(buf.last() == Some(&HEADER[0]));
        return (Decoded::Incomplete, buf.len() - keep);
    };

    if buf.len() - start < FRAME_LEN {
        return (Decoded::Incomplete, start);
    }

    let frame = &buf[start..start + FRAME_LEN];
    match parse_frame(frame) {
        Ok(packet) => {
            trace!("RX {}", hex_bytes(frame));
            (Decoded::Packet(packet), start + FRAME_LEN)
        }
        Err(e) => {
            trace!("RX invalid {} ({})", hex_bytes(frame), e);
            (Decoded::Invalid(e), start + 1)
        }
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == HEADER)
}

fn parse_frame(frame: &[u8]) -> Result<Packet, FrameError> {
    let footer = [frame[OFFSET_FOOTER], frame[OFFSET_FOOTER + 1]];
    if footer != FOOTER {
        return Err(FrameError::BadFooter(footer));
    }

    let (kind, attempt) = Packet::parse_type(frame[OFFSET_TYPE])
        .ok_or(FrameError::UnknownPacketType(frame[OFFSET_TYPE]))?;

    let expected = checksum(frame);
    let actual = frame[OFFSET_CHECKSUM];
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let mut value = [0u8; VALUE_LEN];
    value.copy_from_slice(&frame[OFFSET_VALUE..OFFSET_VALUE + VALUE_LEN]);

    Ok(Packet {
        prefix: frame[OFFSET_PREFIX],
        kind,
        attempt,
        monitor: frame[OFFSET_MONITOR],
        dst: DeviceAddress::from_bytes([frame[OFFSET_DST], frame[OFFSET_DST + 1]]),
        src: DeviceAddress::from_bytes([frame[OFFSET_SRC], frame[OFFSET_SRC + 1]]),
        command: Command::from_code(frame[OFFSET_COMMAND]),
        value,
    })
}

/// Drain every decodable frame from `buf`, leaving any partial frame in place.
///
/// Used by the link reader after each socket read.
pub fn drain(buf: &mut Vec<u8>) -> Vec<Decoded> {
    let mut out = Vec::new();
    loop {
        let (decoded, consumed) = decode(buf);
        buf.drain(..consumed);
        match decoded {
            Decoded::Incomplete => break,
            other => out.push(other),
        }
    }
    out
}
