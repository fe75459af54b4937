//! Composition of raw records, for fixtures and recorded-stream tooling

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::{padded, EVENT_HEADER_LEN, SUBEVENT_HEADER_LEN};

/// Byte order a record is written in. Readers detect the order from the
/// decoding word, so both produce equally valid streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Little,
    Big,
}

fn put(order: Order, dst: &mut [u8], v: u32) {
    match order {
        Order::Little => LittleEndian::write_u32(dst, v),
        Order::Big => BigEndian::write_u32(dst, v),
    }
}

/// Encode a 32-byte event header. The decoding word's low byte must be
/// nonzero for swap detection to work; callers pass it verbatim.
#[allow(clippy::too_many_arguments)]
pub fn event_header(
    order: Order,
    size: u32,
    decoding: u32,
    id: u32,
    seq_nr: u32,
    date: u32,
    time: u32,
    run_nr: u32,
) -> [u8; EVENT_HEADER_LEN] {
    let mut hdr = [0u8; EVENT_HEADER_LEN];
    for (off, v) in [size, decoding, id, seq_nr, date, time, run_nr, 0]
        .into_iter()
        .enumerate()
    {
        put(order, &mut hdr[off * 4..off * 4 + 4], v);
    }
    hdr
}

/// Encode one subevent record: header plus payload words written at the
/// width given by `align_exp` (0 = bytes, 1 = 16-bit, 2 = 32-bit words).
pub fn subevent(order: Order, align_exp: u32, id: u32, trig_nr: u32, words: &[u32]) -> Vec<u8> {
    assert!(align_exp <= 2, "alignment exponent out of range");
    let width = 1usize << align_exp;
    let size = (SUBEVENT_HEADER_LEN + words.len() * width) as u32;
    let decoding = (align_exp << 16) | 0x01;
    let mut bytes = vec![0u8; size as usize];
    for (off, v) in [size, decoding, id, trig_nr].into_iter().enumerate() {
        put(order, &mut bytes[off * 4..off * 4 + 4], v);
    }
    for (i, &w) in words.iter().enumerate() {
        let off = SUBEVENT_HEADER_LEN + i * width;
        match width {
            4 => put(order, &mut bytes[off..off + 4], w),
            2 => match order {
                Order::Little => LittleEndian::write_u16(&mut bytes[off..off + 2], w as u16),
                Order::Big => BigEndian::write_u16(&mut bytes[off..off + 2], w as u16),
            },
            _ => bytes[off] = w as u8,
        }
    }
    bytes
}

/// Assemble already-encoded subevent records into one event, padding each
/// record to the framing boundary.
pub fn event(order: Order, seq_nr: u32, run_nr: u32, subevents: &[Vec<u8>]) -> Vec<u8> {
    let payload: usize = subevents.iter().map(|s| padded(s.len())).sum();
    let size = (EVENT_HEADER_LEN + payload) as u32;
    let mut bytes =
        event_header(order, size, 0x0002_0001, 1, seq_nr, 0, 0, run_nr).to_vec();
    for sub in subevents {
        let at = bytes.len();
        bytes.extend_from_slice(sub);
        bytes.resize(at + padded(sub.len()), 0);
    }
    bytes
}
