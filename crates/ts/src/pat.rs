//! Program Association Table (PAT): owned representation.

use crate::{Result, TsError};
use bytes::Buf;

/// One `program_number -> program_map_PID` entry inside a [`Pat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Owned Program Association Table.
#[derive(Debug, Clone)]
pub struct Pat {
    pub table_id: u8,
    pub transport_stream_id: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    pub programs: Vec<PatProgram>,
}

impl Pat {
    /// Parse an owned PAT eagerly from PSI section bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(TsError::InsufficientData {
                expected: 8,
                actual: data.len(),
            });
        }
        let mut reader = data;
        let table_id = reader.get_u8();
        if table_id != 0x00 {
            return Err(TsError::InvalidTableId {
                expected: 0x00,
                actual: table_id,
            });
        }
        let byte1 = reader.get_u8();
        if byte1 & 0x80 == 0 {
            return Err(TsError::ParseError(
                "PAT must have section syntax indicator set".to_string(),
            ));
        }
        let section_length = ((byte1 as u16 & 0x0F) << 8) | reader.get_u8() as u16;
        if section_length < 9 {
            return Err(TsError::InvalidSectionLength(section_length));
        }
        if data.len() < 3 + section_length as usize {
            return Err(TsError::InsufficientData {
                expected: 3 + section_length as usize,
                actual: data.len(),
            });
        }
        let transport_stream_id = reader.get_u16();
        let byte5 = reader.get_u8();
        let version_number = (byte5 >> 1) & 0x1F;
        let current_next_indicator = (byte5 & 0x01) != 0;
        let section_number = reader.get_u8();
        let last_section_number = reader.get_u8();

        let programs_offset = 8usize;
        let programs_end = 3 + section_length as usize - 4;
        let mut programs = Vec::new();
        let mut cursor = programs_offset;
        while cursor + 4 <= programs_end {
            let program_number = ((data[cursor] as u16) << 8) | data[cursor + 1] as u16;
            let pmt_pid = ((data[cursor + 2] as u16 & 0x1F) << 8) | data[cursor + 3] as u16;
            programs.push(PatProgram {
                program_number,
                pmt_pid,
            });
            cursor += 4;
        }

        Ok(Pat {
            table_id,
            transport_stream_id,
            version_number,
            current_next_indicator,
            section_number,
            last_section_number,
            programs,
        })
    }

    /// Parse an owned PAT with CRC-32/MPEG-2 validation of the full section.
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

    /// Build an owned [`Pat`] from a zero-copy [`crate::parser_zero_copy::PatRef`].
    pub fn from_ref(pat_ref: &crate::parser_zero_copy::PatRef) -> Self {
        let programs = pat_ref
            .programs()
            .map(|p| PatProgram {
                program_number: p.program_number,
                pmt_pid: p.pmt_pid,
            })
            .collect();
        Pat {
            table_id: pat_ref.table_id,
            transport_stream_id: pat_ref.transport_stream_id,
            version_number: pat_ref.version_number,
            current_next_indicator: pat_ref.current_next_indicator,
            section_number: pat_ref.section_number,
            last_section_number: pat_ref.last_section_number,
            programs,
        }
    }

    /// Look up the PMT PID for `program_number`, or the first program if
    /// `program_number` is `-1` ("auto", per SPEC_FULL §6's `program-number`
    /// configuration option).
    pub fn pmt_pid_for(&self, program_number: i32) -> Option<u16> {
        if program_number < 0 {
            self.programs.first().map(|p| p.pmt_pid)
        } else {
            self.programs
                .iter()
                .find(|p| p.program_number as i32 == program_number)
                .map(|p| p.pmt_pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pat_section(programs: &[(u16, u16)]) -> Vec<u8> {
        let mut section = vec![0x00, 0x00, 0x00, 0x00, 0x01, 0xC1, 0x00, 0x00];
        for (program_number, pmt_pid) in programs {
            section.push((program_number >> 8) as u8);
            section.push((program_number & 0xFF) as u8);
            section.push(0xE0 | ((pmt_pid >> 8) as u8 & 0x1F));
            section.push((pmt_pid & 0xFF) as u8);
        }
        let section_length = (section.len() - 3 + 4) as u16;
        section[1] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
        section[2] = (section_length & 0xFF) as u8;
        let crc = crate::crc32::mpeg2_crc32(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    #[test]
    fn parses_owned_pat_with_programs() {
        let data = build_pat_section(&[(1, 0x1000), (2, 0x1001)]);
        let pat = Pat::parse(&data).unwrap();
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.programs[0].program_number, 1);
        assert_eq!(pat.programs[0].pmt_pid, 0x1000);
    }

    #[test]
    fn auto_program_selects_first() {
        let data = build_pat_section(&[(5, 0x1000), (6, 0x1001)]);
        let pat = Pat::parse(&data).unwrap();
        assert_eq!(pat.pmt_pid_for(-1), Some(0x1000));
        assert_eq!(pat.pmt_pid_for(6), Some(0x1001));
        assert_eq!(pat.pmt_pid_for(99), None);
    }

    #[test]
    fn rejects_short_section() {
        assert!(matches!(
            Pat::parse(&[0x00, 0x00]),
            Err(TsError::InsufficientData { .. })
        ));
    }
}
