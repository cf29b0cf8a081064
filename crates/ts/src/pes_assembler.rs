//! Per-PID PES reassembly state machine (SPEC_FULL §4.6).
//!
//! One [`PesAssembler`] is owned per elementary-stream PID. The demux layer
//! (`crate::demux::TsDemux`) drives it with `(pusi, payload)` pairs taken
//! straight off [`crate::parser_zero_copy::TsPacketRef`].

use bytes::{Bytes, BytesMut};

use crate::pes::PesHeader;
use crate::{Result, TsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PesState {
    Empty,
    Header,
    Buffer,
    Discont,
}

/// A fully reassembled PES payload, timestamps converted from 90 kHz units.
#[derive(Debug, Clone)]
pub struct PesUnit {
    pub pid: u16,
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub pts_ns: Option<i64>,
    pub dts_ns: Option<i64>,
    pub payload: Bytes,
}

/// 90 kHz -> nanoseconds.
pub fn pts_to_ns(value: u64) -> i64 {
    (value as i128 * 1_000_000_000 / 90_000) as i64
}

/// 27 MHz -> nanoseconds.
pub fn pcr_to_ns(value: u64) -> i64 {
    (value as i128 * 1_000_000_000 / 27_000_000) as i64
}

/// 2^33 * 300: the 33-bit PCR/PTS wrap period expressed in 27 MHz ticks.
pub const PCR_WRAP_27MHZ: u64 = (1u64 << 33) * 300;

/// A `(gsttime, pcr)` pair anchoring PTS-to-stream-time conversion.
#[derive(Debug, Clone, Copy)]
pub struct PcrAnchor {
    pub gsttime_ns: i64,
    pub pcr_27mhz: u64,
}

impl PcrAnchor {
    /// `t = anchor.gsttime − pcr_to_ns(anchor.pcr) + pts_to_ns(pts)`, adding
    /// one wrap period when `anchor.pcr > pts * 300` (SPEC_FULL §4.6, §8
    /// scenario 6).
    pub fn pts_to_stream_time_ns(&self, pts_90khz: u64) -> i64 {
        let base = self.gsttime_ns - pcr_to_ns(self.pcr_27mhz) + pts_to_ns(pts_90khz);
        if self.pcr_27mhz > pts_90khz * 300 {
            base + pcr_to_ns(PCR_WRAP_27MHZ)
        } else {
            base
        }
    }
}

/// Per-PID PES reassembly state machine.
#[derive(Debug)]
pub struct PesAssembler {
    pid: u16,
    cap: usize,
    state: PesState,
    header_buf: BytesMut,
    header_packet_count: usize,
    output: BytesMut,
    stream_id: Option<u8>,
    pts: Option<u64>,
    dts: Option<u64>,
    /// Last PTS observed on a completed PES unit, retained across flushes.
    pub last_pts: Option<u64>,
}

impl PesAssembler {
    pub fn new(pid: u16, pending_buffer_cap: usize) -> Self {
        Self {
            pid,
            cap: pending_buffer_cap,
            state: PesState::Empty,
            header_buf: BytesMut::new(),
            header_packet_count: 0,
            output: BytesMut::new(),
            stream_id: None,
            pts: None,
            dts: None,
            last_pts: None,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn is_discont(&self) -> bool {
        self.state == PesState::Discont
    }

    /// Feed one TS packet's payload. Returns any PES units this packet
    /// caused to complete (normally 0 or 1; 2 only in the rare case a
    /// flush-and-restart both land on the same packet).
    pub fn push(&mut self, pusi: bool, payload: Bytes) -> Result<Vec<PesUnit>> {
        let mut completed = Vec::new();
        match self.state {
            PesState::Empty | PesState::Discont => {
                if !pusi {
                    self.state = PesState::Discont;
                    return Ok(completed);
                }
                self.start_header(payload)?;
            }
            PesState::Header => {
                if pusi {
                    // A new unit is starting before the previous header
                    // finished assembling; the partial header is lost.
                    self.header_buf.clear();
                    self.header_packet_count = 0;
                }
                self.accumulate_header(payload)?;
            }
            PesState::Buffer => {
                if pusi {
                    if let Some(unit) = self.flush() {
                        completed.push(unit);
                    }
                    self.start_header(payload)?;
                } else {
                    self.output.extend_from_slice(&payload);
                }
            }
        }
        Ok(completed)
    }

    /// Flush whatever is buffered and reset to `Empty`. Call at end-of-stream
    /// or before a seek so no trailing payload is lost.
    pub fn finish(&mut self) -> Option<PesUnit> {
        let unit = self.flush();
        self.state = PesState::Empty;
        unit
    }

    fn start_header(&mut self, payload: Bytes) -> Result<()> {
        self.header_buf.clear();
        self.header_buf.extend_from_slice(&payload);
        self.header_packet_count = 1;
        self.state = PesState::Header;
        self.try_parse_header()
    }

    fn accumulate_header(&mut self, payload: Bytes) -> Result<()> {
        self.header_packet_count += 1;
        if self.header_packet_count > self.cap {
            self.state = PesState::Discont;
            self.header_buf.clear();
            self.header_packet_count = 0;
            return Ok(());
        }
        self.header_buf.extend_from_slice(&payload);
        self.try_parse_header()
    }

    fn try_parse_header(&mut self) -> Result<()> {
        if self.header_buf.len() < 9 {
            return Ok(());
        }
        let needed = 9 + self.header_buf[8] as usize;
        if self.header_buf.len() < needed {
            return Ok(());
        }
        match PesHeader::parse(&self.header_buf) {
            Ok(header) => {
                self.stream_id = Some(header.stream_id);
                self.pts = header.pts;
                self.dts = header.dts;
                self.output.clear();
                self.output
                    .extend_from_slice(&self.header_buf[header.payload_offset..]);
                self.header_buf.clear();
                self.header_packet_count = 0;
                self.state = PesState::Buffer;
                Ok(())
            }
            Err(TsError::InvalidPesStartCode) | Err(TsError::InvalidPtsDtsFlags(_)) => {
                self.state = PesState::Discont;
                self.header_buf.clear();
                self.header_packet_count = 0;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> Option<PesUnit> {
        if self.state != PesState::Buffer {
            return None;
        }
        let payload = self.output.split().freeze();
        let unit = PesUnit {
            pid: self.pid,
            stream_id: self.stream_id.unwrap_or(0),
            pts: self.pts,
            dts: self.dts,
            pts_ns: self.pts.map(pts_to_ns),
            dts_ns: self.dts.map(pts_to_ns),
            payload,
        };
        if unit.pts.is_some() {
            self.last_pts = unit.pts;
        }
        Some(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes_packet(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80];
        match pts {
            Some(pts) => {
                data.push(0x80); // PTS only
                data.push(0x05);
                let mut pts_bytes = [0u8; 5];
                pts_bytes[0] = 0x21 | (((pts >> 30) as u8 & 0x07) << 1);
                pts_bytes[1] = (pts >> 22) as u8;
                pts_bytes[2] = ((pts >> 15) as u8 & 0x7F) << 1 | 0x01;
                pts_bytes[3] = (pts >> 7) as u8;
                pts_bytes[4] = ((pts as u8) & 0x7F) << 1 | 0x01;
                data.extend_from_slice(&pts_bytes);
            }
            None => {
                data.push(0x00);
                data.push(0x00);
            }
        }
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn assembles_single_packet_unit() {
        let mut asm = PesAssembler::new(0x100, 256);
        let pkt = pes_packet(0xE0, Some(90_000), b"hello");
        let units = asm.push(true, Bytes::from(pkt)).unwrap();
        assert!(units.is_empty());
        let units = asm.push(true, Bytes::from(pes_packet(0xE0, Some(180_000), b"next"))).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload[..], b"hello");
        assert_eq!(units[0].pts, Some(90_000));
        assert_eq!(units[0].pts_ns, Some(1_000_000_000));
    }

    #[test]
    fn appends_continuation_packets_before_flush() {
        let mut asm = PesAssembler::new(0x100, 256);
        asm.push(true, Bytes::from(pes_packet(0xE0, Some(0), b"AAA")))
            .unwrap();
        asm.push(false, Bytes::from_static(b"BBB")).unwrap();
        let units = asm
            .push(true, Bytes::from(pes_packet(0xE0, Some(9_000), b"CCC")))
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload[..], b"AAABBB");
    }

    #[test]
    fn no_pusi_before_any_header_enters_discont() {
        let mut asm = PesAssembler::new(0x100, 256);
        let units = asm.push(false, Bytes::from_static(b"orphan")).unwrap();
        assert!(units.is_empty());
        assert!(asm.is_discont());
    }

    #[test]
    fn header_overflow_enters_discont() {
        let mut asm = PesAssembler::new(0x100, 2);
        // Start a header with too few bytes to parse, then keep feeding
        // incomplete packets until the pending-buffer cap is exceeded.
        asm.push(true, Bytes::from_static(&[0x00, 0x00, 0x01, 0xE0]))
            .unwrap();
        asm.push(false, Bytes::from_static(&[0x00])).unwrap();
        asm.push(false, Bytes::from_static(&[0x00])).unwrap();
        assert!(asm.is_discont());
    }

    #[test]
    fn pcr_anchor_converts_pts_without_wrap() {
        let anchor = PcrAnchor {
            gsttime_ns: 0,
            pcr_27mhz: 0,
        };
        assert_eq!(anchor.pts_to_stream_time_ns(0), 0);
    }

    #[test]
    fn pcr_anchor_handles_wrap() {
        // anchor.pcr close to the 33-bit*300 ceiling, pts small -> wrap applies.
        let anchor = PcrAnchor {
            gsttime_ns: 0,
            pcr_27mhz: 0x1_FFFF_FFFF_F0,
        };
        let t = anchor.pts_to_stream_time_ns(1000);
        let expected = -pcr_to_ns(0x1_FFFF_FFFF_F0) + pcr_to_ns(PCR_WRAP_27MHZ) + pts_to_ns(1000);
        assert_eq!(t, expected);
    }
}
