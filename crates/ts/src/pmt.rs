//! Program Map Table (PMT): owned representation and stream-type enumeration.

use crate::descriptor::DescriptorIterator;
use crate::{Result, TsError};
use bytes::{Buf, Bytes};

/// MPEG-TS `stream_type` values relevant to pad-capability selection.
///
/// Values follow ISO/IEC 13818-1 Table 2-34, plus the handful of
/// registration-descriptor-disambiguated private types (`0x06` carrying
/// AC-3/Enhanced AC-3/Teletext/Subtitling) that the descriptor layer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg1Audio,
    Mpeg2Audio,
    Mpeg2AudioExtension,
    Mpeg4Video,
    Mpeg4Audio,
    H264,
    H265,
    Ac3,
    EnhancedAc3,
    Aac,
    AacLatm,
    Dts,
    PrivateData,
    Other(u8),
}

impl StreamType {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            StreamType::Mpeg1Video
                | StreamType::Mpeg2Video
                | StreamType::Mpeg4Video
                | StreamType::H264
                | StreamType::H265
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            StreamType::Mpeg1Audio
                | StreamType::Mpeg2Audio
                | StreamType::Mpeg2AudioExtension
                | StreamType::Mpeg4Audio
                | StreamType::Ac3
                | StreamType::EnhancedAc3
                | StreamType::Aac
                | StreamType::AacLatm
                | StreamType::Dts
        )
    }

    pub fn raw(&self) -> u8 {
        match self {
            StreamType::Mpeg1Video => 0x01,
            StreamType::Mpeg2Video => 0x02,
            StreamType::Mpeg1Audio => 0x03,
            StreamType::Mpeg2Audio => 0x04,
            StreamType::PrivateData => 0x06,
            StreamType::Mpeg2AudioExtension => 0x0A,
            StreamType::Mpeg4Video => 0x10,
            StreamType::Mpeg4Audio => 0x11,
            StreamType::H264 => 0x1B,
            StreamType::H265 => 0x24,
            StreamType::AacLatm => 0x11,
            StreamType::Aac => 0x0F,
            StreamType::Ac3 => 0x81,
            StreamType::EnhancedAc3 => 0x87,
            StreamType::Dts => 0x82,
            StreamType::Other(v) => *v,
        }
    }
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => StreamType::Mpeg1Video,
            0x02 => StreamType::Mpeg2Video,
            0x03 => StreamType::Mpeg1Audio,
            0x04 => StreamType::Mpeg2Audio,
            0x06 => StreamType::PrivateData,
            0x0A => StreamType::Mpeg2AudioExtension,
            0x0F => StreamType::Aac,
            0x10 => StreamType::Mpeg4Video,
            0x11 => StreamType::Mpeg4Audio,
            0x1B => StreamType::H264,
            0x24 => StreamType::H265,
            0x81 => StreamType::Ac3,
            0x82 => StreamType::Dts,
            0x87 => StreamType::EnhancedAc3,
            other => StreamType::Other(other),
        }
    }
}

/// Owned elementary stream entry inside a [`Pmt`].
#[derive(Debug, Clone)]
pub struct PmtStream {
    pub stream_type: StreamType,
    pub elementary_pid: u16,
    pub es_info: Bytes,
}

impl PmtStream {
    /// Iterate the stream's own descriptor loop (language, AC-3, registration...).
    pub fn descriptors(&self) -> DescriptorIterator {
        DescriptorIterator::new(self.es_info.clone())
    }
}

/// Owned Program Map Table.
#[derive(Debug, Clone)]
pub struct Pmt {
    pub table_id: u8,
    pub program_number: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    pub pcr_pid: u16,
    pub program_info: Bytes,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    /// Parse an owned PMT eagerly from PSI section bytes (without the
    /// `pointer_field`; callers strip that via [`crate::packet::TsPacket::get_psi_payload`]).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(TsError::InsufficientData {
                expected: 12,
                actual: data.len(),
            });
        }
        let mut reader = data;
        let table_id = reader.get_u8();
        if table_id != 0x02 {
            return Err(TsError::InvalidTableId {
                expected: 0x02,
                actual: table_id,
            });
        }
        let byte1 = reader.get_u8();
        if byte1 & 0x80 == 0 {
            return Err(TsError::ParseError(
                "PMT must have section syntax indicator set".to_string(),
            ));
        }
        let section_length = ((byte1 as u16 & 0x0F) << 8) | reader.get_u8() as u16;
        if section_length < 13 {
            return Err(TsError::InvalidSectionLength(section_length));
        }
        if data.len() < 3 + section_length as usize {
            return Err(TsError::InsufficientData {
                expected: 3 + section_length as usize,
                actual: data.len(),
            });
        }
        let program_number = reader.get_u16();
        let byte5 = reader.get_u8();
        let version_number = (byte5 >> 1) & 0x1F;
        let current_next_indicator = (byte5 & 0x01) != 0;
        let section_number = reader.get_u8();
        let last_section_number = reader.get_u8();
        let pcr_pid_high = reader.get_u8();
        let pcr_pid_low = reader.get_u8();
        let pcr_pid = ((pcr_pid_high as u16 & 0x1F) << 8) | pcr_pid_low as u16;
        let prog_info_len_high = reader.get_u8();
        let prog_info_len_low = reader.get_u8();
        let program_info_length =
            ((prog_info_len_high as u16 & 0x0F) << 8) | prog_info_len_low as u16;
        let program_info_length = program_info_length as usize;

        if (section_length as usize) < 9 + program_info_length + 4 {
            return Err(TsError::InvalidSectionLength(section_length));
        }

        let program_info_offset = 12usize;
        if data.len() < program_info_offset + program_info_length {
            return Err(TsError::InsufficientData {
                expected: program_info_offset + program_info_length,
                actual: data.len(),
            });
        }
        let program_info =
            Bytes::copy_from_slice(&data[program_info_offset..program_info_offset + program_info_length]);

        let streams_offset = program_info_offset + program_info_length;
        let streams_end = 3 + section_length as usize - 4;
        let mut cursor = streams_offset;
        let mut streams = Vec::new();
        while cursor + 5 <= streams_end {
            let stream_type = StreamType::from(data[cursor]);
            let elementary_pid =
                ((data[cursor + 1] as u16 & 0x1F) << 8) | data[cursor + 2] as u16;
            let es_info_length =
                ((data[cursor + 3] as u16 & 0x0F) << 8) | data[cursor + 4] as u16;
            let es_info_length = es_info_length as usize;
            let es_info_start = cursor + 5;
            if es_info_start + es_info_length > streams_end {
                return Err(TsError::InsufficientData {
                    expected: es_info_start + es_info_length,
                    actual: streams_end,
                });
            }
            let es_info = Bytes::copy_from_slice(&data[es_info_start..es_info_start + es_info_length]);
            streams.push(PmtStream {
                stream_type,
                elementary_pid,
                es_info,
            });
            cursor = es_info_start + es_info_length;
        }

        Ok(Pmt {
            table_id,
            program_number,
            version_number,
            current_next_indicator,
            section_number,
            last_section_number,
            pcr_pid,
            program_info,
            streams,
        })
    }

    /// Parse an owned PMT with CRC-32/MPEG-2 validation of the full section.
    pub fn parse_with_crc(data: &[u8]) -> Result<Self> {
        if data.len() >= 7 {
            let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;
            let section_end = 3 + section_length as usize;
            if section_end <= data.len()
                && section_end >= 4
                && !crate::crc32::validate_section_crc32(&data[..section_end])
            {
                let stored = u32::from_be_bytes([
                    data[section_end - 4],
                    data[section_end - 3],
                    data[section_end - 2],
                    data[section_end - 1],
                ]);
                let calculated = crate::crc32::mpeg2_crc32(&data[..section_end - 4]);
                return Err(TsError::Crc32Mismatch {
                    expected: stored,
                    calculated,
                });
            }
        }
        Self::parse(data)
    }

    /// Build an owned [`Pmt`] from a zero-copy [`crate::parser_zero_copy::PmtRef`].
    pub fn from_ref(pmt_ref: &crate::parser_zero_copy::PmtRef) -> Result<Self> {
        let mut streams = Vec::new();
        for entry in pmt_ref.streams() {
            let entry = entry?;
            streams.push(PmtStream {
                stream_type: entry.stream_type,
                elementary_pid: entry.elementary_pid,
                es_info: entry.es_info,
            });
        }
        Ok(Pmt {
            table_id: pmt_ref.table_id,
            program_number: pmt_ref.program_number,
            version_number: pmt_ref.version_number,
            current_next_indicator: pmt_ref.current_next_indicator,
            section_number: pmt_ref.section_number,
            last_section_number: pmt_ref.last_section_number,
            pcr_pid: pmt_ref.pcr_pid,
            program_info: pmt_ref.program_info(),
            streams,
        })
    }

    /// Diff against a previously-seen PMT for the same program, returning the
    /// elementary PIDs that were added and removed. Used to drive
    /// stream-added/stream-removed notifications on PMT version change.
    pub fn diff(&self, previous: &Pmt) -> PmtDiff {
        let current: std::collections::HashSet<u16> =
            self.streams.iter().map(|s| s.elementary_pid).collect();
        let prior: std::collections::HashSet<u16> =
            previous.streams.iter().map(|s| s.elementary_pid).collect();

        let added = self
            .streams
            .iter()
            .filter(|s| !prior.contains(&s.elementary_pid))
            .cloned()
            .collect();
        let removed = previous
            .streams
            .iter()
            .map(|s| s.elementary_pid)
            .filter(|pid| !current.contains(pid))
            .collect();

        PmtDiff { added, removed }
    }
}

/// Result of comparing two successive PMT versions for the same program.
#[derive(Debug, Clone, Default)]
pub struct PmtDiff {
    pub added: Vec<PmtStream>,
    pub removed: Vec<u16>,
}

impl PmtDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
