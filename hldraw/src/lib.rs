//! Byte-order-safe views over the raw event and subevent wire format

pub mod ser;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

/// Fixed size of the event header in bytes
pub const EVENT_HEADER_LEN: usize = 32;
/// Fixed size of the subevent header in bytes
pub const SUBEVENT_HEADER_LEN: usize = 16;
/// Subevent records inside an event are padded to this boundary
pub const RECORD_PADDING: usize = 8;

/// Decoding errors for malformed raw records. Malformed data is reported,
/// never repaired.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{kind} header needs {need} bytes, only {len} available")]
    Truncated {
        kind: &'static str,
        need: usize,
        len: usize,
    },
    #[error("{kind} declares {size} bytes, only {len} available")]
    Oversize {
        kind: &'static str,
        size: u32,
        len: usize,
    },
    #[error("{kind} declares impossible size {size}")]
    BadSize { kind: &'static str, size: u32 },
    #[error("subevent alignment exponent {exp} not in 0..=2")]
    BadAlignment { exp: u32 },
    #[error("payload of {len} bytes not a multiple of {align}-byte words")]
    Misaligned { len: usize, align: usize },
    #[error("payload word {idx} out of range, subevent has {words} words")]
    OutOfRange { idx: usize, words: usize },
}

/// Round a record size up to the next padding boundary
pub fn padded(len: usize) -> usize {
    (len + RECORD_PADDING - 1) & !(RECORD_PADDING - 1)
}

// All multi-byte header fields go through the swap-detecting accessor:
// the decoding word's most significant byte is zero in natural order, so a
// natural-order read above 0xffffff means the record was written in the
// opposite byte order.
fn swapped(bytes: &[u8], decoding_off: usize) -> bool {
    LittleEndian::read_u32(&bytes[decoding_off..decoding_off + 4]) > 0xff_ffff
}

fn field(bytes: &[u8], off: usize, swap: bool) -> u32 {
    if swap {
        BigEndian::read_u32(&bytes[off..off + 4])
    } else {
        LittleEndian::read_u32(&bytes[off..off + 4])
    }
}

/// Read-only view over one event record: 32-byte header plus the subevent
/// payload it frames. The view borrows externally-owned buffer memory and
/// never copies fields except through the swap-safe accessor.
#[derive(Clone, Copy)]
pub struct RawEvent<'a> {
    bytes: &'a [u8],
    swap: bool,
}

impl<'a> RawEvent<'a> {
    /// Parse one event at the head of `bytes`, validating the declared size
    /// against the backing slice.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        if bytes.len() < EVENT_HEADER_LEN {
            return Err(WireError::Truncated {
                kind: "event",
                need: EVENT_HEADER_LEN,
                len: bytes.len(),
            });
        }
        let swap = swapped(bytes, 4);
        let size = field(bytes, 0, swap);
        if (size as usize) < EVENT_HEADER_LEN {
            return Err(WireError::BadSize {
                kind: "event",
                size,
            });
        }
        if size as usize > bytes.len() {
            return Err(WireError::Oversize {
                kind: "event",
                size,
                len: bytes.len(),
            });
        }
        Ok(RawEvent {
            bytes: &bytes[..size as usize],
            swap,
        })
    }

    fn value(&self, off: usize) -> u32 {
        field(self.bytes, off, self.swap)
    }

    pub fn is_swapped(&self) -> bool {
        self.swap
    }

    /// Total size in bytes, header included
    pub fn size(&self) -> u32 {
        self.value(0)
    }

    pub fn decoding(&self) -> u32 {
        self.value(4)
    }

    pub fn id(&self) -> u32 {
        self.value(8)
    }

    pub fn seq_nr(&self) -> u32 {
        self.value(12)
    }

    pub fn run_nr(&self) -> u32 {
        self.value(24)
    }

    /// Trigger code from the low bits of the id word
    pub fn trigger_code(&self) -> u8 {
        (self.id() & 0xf) as u8
    }

    /// Error bit: set when some subsystem flagged this event
    pub fn has_error(&self) -> bool {
        self.id() & 0x8000_0000 != 0
    }

    /// Assembly date, packed ISO-C style: years since 1900, zero-based
    /// month, day of month
    pub fn date(&self) -> Option<NaiveDate> {
        let v = self.value(16);
        NaiveDate::from_ymd_opt(
            1900 + ((v >> 16) & 0xff) as i32,
            1 + ((v >> 8) & 0xff),
            v & 0xff,
        )
    }

    /// Assembly time, packed ISO-C style: hour, minute, second
    pub fn time(&self) -> Option<NaiveTime> {
        let v = self.value(20);
        NaiveTime::from_hms_opt((v >> 16) & 0xff, (v >> 8) & 0xff, v & 0xff)
    }

    /// Bytes following the event header
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[EVENT_HEADER_LEN..]
    }

    /// Iterate over the subevent records framed by this event
    pub fn subevents(&self) -> SubIter<'a> {
        SubIter {
            bytes: self.payload(),
        }
    }
}

impl std::fmt::Debug for RawEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEvent")
            .field("size", &self.size())
            .field("id", &self.id())
            .field("seq_nr", &self.seq_nr())
            .field("swapped", &self.swap)
            .finish()
    }
}

/// Read-only view over one subevent record: 16-byte header plus payload
/// words of `alignment()` bytes each.
#[derive(Clone, Copy)]
pub struct RawSubevent<'a> {
    bytes: &'a [u8],
    swap: bool,
    align: usize,
}

impl<'a> RawSubevent<'a> {
    /// Parse one subevent at the head of `bytes`. The alignment exponent and
    /// the payload length are validated here so that word access cannot read
    /// past the declared size.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        if bytes.len() < SUBEVENT_HEADER_LEN {
            return Err(WireError::Truncated {
                kind: "subevent",
                need: SUBEVENT_HEADER_LEN,
                len: bytes.len(),
            });
        }
        let swap = swapped(bytes, 4);
        let size = field(bytes, 0, swap);
        if (size as usize) < SUBEVENT_HEADER_LEN {
            return Err(WireError::BadSize {
                kind: "subevent",
                size,
            });
        }
        if size as usize > bytes.len() {
            return Err(WireError::Oversize {
                kind: "subevent",
                size,
                len: bytes.len(),
            });
        }
        let exp = (field(bytes, 4, swap) >> 16) & 0xff;
        if exp > 2 {
            return Err(WireError::BadAlignment { exp });
        }
        let align = 1usize << exp;
        let payload = size as usize - SUBEVENT_HEADER_LEN;
        if payload % align != 0 {
            return Err(WireError::Misaligned {
                len: payload,
                align,
            });
        }
        Ok(RawSubevent {
            bytes: &bytes[..size as usize],
            swap,
            align,
        })
    }

    fn value(&self, off: usize) -> u32 {
        field(self.bytes, off, self.swap)
    }

    pub fn is_swapped(&self) -> bool {
        self.swap
    }

    /// Total size in bytes, header included
    pub fn size(&self) -> u32 {
        self.value(0)
    }

    pub fn decoding(&self) -> u32 {
        self.value(4)
    }

    pub fn id(&self) -> u32 {
        self.value(8)
    }

    pub fn trig_nr(&self) -> u32 {
        self.value(12)
    }

    /// Low byte of the trigger number: the tag common to all subsystems of
    /// one assembled event
    pub fn trigger_tag(&self) -> u8 {
        (self.trig_nr() & 0xff) as u8
    }

    /// MSB of the id marks a subevent carrying broken data
    pub fn is_broken(&self) -> bool {
        self.id() & 0x8000_0000 != 0
    }

    /// Subsystem id without the broken-data flag
    pub fn subsystem(&self) -> u32 {
        self.id() & 0x7fff_ffff
    }

    /// Payload word width in bytes, from bits 16-23 of the decoding word
    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SUBEVENT_HEADER_LEN..]
    }

    /// Number of alignment-sized payload words
    pub fn num_words(&self) -> usize {
        self.payload().len() / self.align
    }

    /// Payload word by zero-based word index, widened to u32. Two-byte words
    /// swap with a 16-bit swap, four-byte words through the 32-bit accessor,
    /// single bytes verbatim.
    pub fn data(&self, idx: usize) -> Result<u32, WireError> {
        let payload = self.payload();
        if (idx + 1) * self.align > payload.len() {
            return Err(WireError::OutOfRange {
                idx,
                words: self.num_words(),
            });
        }
        let off = idx * self.align;
        Ok(match self.align {
            4 => {
                if self.swap {
                    BigEndian::read_u32(&payload[off..off + 4])
                } else {
                    LittleEndian::read_u32(&payload[off..off + 4])
                }
            }
            2 => {
                if self.swap {
                    BigEndian::read_u16(&payload[off..off + 2]) as u32
                } else {
                    LittleEndian::read_u16(&payload[off..off + 2]) as u32
                }
            }
            _ => payload[off] as u32,
        })
    }

    /// Copy `dst.len()` payload words starting at `start` into caller-owned
    /// memory as u32 units regardless of the source alignment.
    pub fn copy_data_to(&self, dst: &mut [u32], start: usize) -> Result<(), WireError> {
        let words = self.num_words();
        if start + dst.len() > words {
            return Err(WireError::OutOfRange {
                idx: start + dst.len().saturating_sub(1),
                words,
            });
        }
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.data(start + i)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RawSubevent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSubevent")
            .field("size", &self.size())
            .field("id", &self.id())
            .field("trig_nr", &self.trig_nr())
            .field("alignment", &self.align)
            .field("swapped", &self.swap)
            .finish()
    }
}

/// Iterator over consecutive event records in a byte slice
pub struct EventIter<'a> {
    bytes: &'a [u8],
}

impl<'a> EventIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        EventIter { bytes }
    }
}

impl<'a> Iterator for EventIter<'a> {
    type Item = Result<RawEvent<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        match RawEvent::parse(self.bytes) {
            Ok(ev) => {
                let step = padded(ev.size() as usize).min(self.bytes.len());
                self.bytes = &self.bytes[step..];
                Some(Ok(ev))
            }
            Err(e) => {
                // A malformed record poisons the rest of the slice
                self.bytes = &[];
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the padded subevent records inside one event
pub struct SubIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for SubIter<'a> {
    type Item = Result<RawSubevent<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        match RawSubevent::parse(self.bytes) {
            Ok(sub) => {
                let step = padded(sub.size() as usize).min(self.bytes.len());
                self.bytes = &self.bytes[step..];
                Some(Ok(sub))
            }
            Err(e) => {
                self.bytes = &[];
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::{self, Order};

    #[test]
    fn swap_detection_is_pure_and_stable() {
        for order in [Order::Little, Order::Big] {
            let bytes = ser::event_header(order, 32, 0x00020001, 1, 7, 0, 0, 42);
            let ev = RawEvent::parse(&bytes).unwrap();
            assert_eq!(ev.is_swapped(), order == Order::Big);
            assert_eq!(ev.decoding(), 0x00020001);
            // Interpreted values are independent of the byte order on disk
            assert_eq!(ev.size(), 32);
            assert_eq!(ev.seq_nr(), 7);
            assert_eq!(ev.run_nr(), 42);
        }
    }

    #[test]
    fn truncated_and_oversize_headers_fail() {
        let bytes = ser::event_header(Order::Little, 64, 0x00020001, 1, 0, 0, 0, 0);
        assert!(matches!(
            RawEvent::parse(&bytes[..16]),
            Err(WireError::Truncated { .. })
        ));
        // Declared 64 bytes but only the 32-byte header is present
        assert!(matches!(
            RawEvent::parse(&bytes),
            Err(WireError::Oversize { .. })
        ));
    }

    #[test]
    fn zero_size_is_reported_not_repaired() {
        let bytes = ser::event_header(Order::Little, 0, 0x00020001, 1, 0, 0, 0, 0);
        assert!(matches!(
            RawEvent::parse(&bytes),
            Err(WireError::BadSize { .. })
        ));
    }

    #[test]
    fn date_and_time_unpack() {
        // 2012-10-28 13:59:07
        let date = (112 << 16) | (9 << 8) | 28;
        let time = (13 << 16) | (59 << 8) | 7;
        let bytes = ser::event_header(Order::Little, 32, 0x00020001, 1, 0, date, time, 0);
        let ev = RawEvent::parse(&bytes).unwrap();
        assert_eq!(ev.date(), NaiveDate::from_ymd_opt(2012, 10, 28));
        assert_eq!(ev.time(), NaiveTime::from_hms_opt(13, 59, 7));
    }

    #[test]
    fn payload_words_by_alignment() {
        for order in [Order::Little, Order::Big] {
            // 32-bit words
            let sub = ser::subevent(order, 2, 0x8001, 0xab, &[0xdeadbeef, 0x00c0ffee]);
            let sub = RawSubevent::parse(&sub).unwrap();
            assert_eq!(sub.alignment(), 4);
            assert_eq!(sub.num_words(), 2);
            assert_eq!(sub.data(0), Ok(0xdeadbeef));
            assert_eq!(sub.data(1), Ok(0x00c0ffee));

            // 16-bit words take the short swap path
            let sub = ser::subevent(order, 1, 0x8001, 0xab, &[0x1234, 0xfeed]);
            let sub = RawSubevent::parse(&sub).unwrap();
            assert_eq!(sub.alignment(), 2);
            assert_eq!(sub.data(0), Ok(0x1234));
            assert_eq!(sub.data(1), Ok(0xfeed));

            // Bytes are verbatim
            let sub = ser::subevent(order, 0, 0x8001, 0xab, &[0x12, 0xff]);
            let sub = RawSubevent::parse(&sub).unwrap();
            assert_eq!(sub.alignment(), 1);
            assert_eq!(sub.data(0), Ok(0x12));
            assert_eq!(sub.data(1), Ok(0xff));
        }
    }

    #[test]
    fn word_access_never_reads_past_declared_size() {
        for exp in 0..=2u32 {
            let words: Vec<u32> = (0..5).collect();
            let sub = ser::subevent(Order::Little, exp, 0x8001, 0, &words);
            let sub = RawSubevent::parse(&sub).unwrap();
            for idx in 0..sub.num_words() {
                assert!(sub.data(idx).is_ok());
            }
            assert!(matches!(
                sub.data(sub.num_words()),
                Err(WireError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn bad_alignment_exponent_rejected() {
        let mut bytes = ser::subevent(Order::Little, 2, 0x8001, 0, &[1]);
        // Rewrite the alignment byte of the decoding word to an exponent of 5
        bytes[6] = 5;
        assert!(matches!(
            RawSubevent::parse(&bytes),
            Err(WireError::BadAlignment { exp: 5 })
        ));
    }

    #[test]
    fn copy_widens_to_u32() {
        let sub = ser::subevent(Order::Big, 1, 0x8001, 0, &[10, 20, 30, 40]);
        let sub = RawSubevent::parse(&sub).unwrap();
        let mut dst = [0u32; 2];
        sub.copy_data_to(&mut dst, 1).unwrap();
        assert_eq!(dst, [20, 30]);
        let mut dst = [0u32; 4];
        assert!(sub.copy_data_to(&mut dst, 1).is_err());
    }

    #[test]
    fn broken_flag_and_trigger_tag() {
        let sub = ser::subevent(Order::Little, 2, 0x8000_0301, 0x00aa_bbcc, &[]);
        let sub = RawSubevent::parse(&sub).unwrap();
        assert!(sub.is_broken());
        assert_eq!(sub.subsystem(), 0x301);
        assert_eq!(sub.trigger_tag(), 0xcc);
    }

    #[test]
    fn event_frames_padded_subevents() {
        let subs = vec![
            ser::subevent(Order::Little, 2, 0x301, 1, &[0xa]),
            ser::subevent(Order::Little, 2, 0x302, 1, &[0xb, 0xc]),
        ];
        let bytes = ser::event(Order::Little, 3, 9, &subs);
        let ev = RawEvent::parse(&bytes).unwrap();
        let got: Vec<_> = ev.subevents().map(|s| s.unwrap().subsystem()).collect();
        assert_eq!(got, vec![0x301, 0x302]);
    }
}
