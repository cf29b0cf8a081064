//! Error types for MPEG-TS parsing, demultiplexing and indexing.

use thiserror::Error;

/// Errors produced while parsing transport stream packets, PSI sections, PES
/// headers, and while building or querying the PCR index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TsError {
    #[error("invalid TS packet size: {0} bytes")]
    InvalidPacketSize(usize),

    #[error("invalid sync byte: 0x{0:02x} (expected 0x47)")]
    InvalidSyncByte(u8),

    #[error("insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid table_id: expected 0x{expected:02x}, got 0x{actual:02x}")]
    InvalidTableId { expected: u8, actual: u8 },

    #[error("invalid section_length: {0}")]
    InvalidSectionLength(u16),

    #[error("CRC-32 mismatch: expected 0x{expected:08x}, calculated 0x{calculated:08x}")]
    Crc32Mismatch { expected: u32, calculated: u32 },

    #[error("duplicate packet on PID {pid}: continuity_counter {cc} repeated")]
    DuplicatePacket { pid: u16, cc: u8 },

    #[error("continuity error on PID {pid}: expected counter {expected}, got {actual}")]
    ContinuityError { pid: u16, expected: u8, actual: u8 },

    #[error("invalid PES start code (expected 0x000001)")]
    InvalidPesStartCode,

    #[error("invalid PTS/DTS flags: 0b{0:02b}")]
    InvalidPtsDtsFlags(u8),

    #[error("invalid SCTE-35 section: {0}")]
    InvalidScte35(String),

    #[error("parse error: {0}")]
    ParseError(String),

    // --- TSD-level errors (SPEC_FULL §7) ---
    #[error("malformed transport stream: {0}")]
    MalformedTs(String),

    #[error("PMT missing for program {program_number}")]
    PmtMissing { program_number: i32 },

    #[error("seek failed: {0}")]
    SeekFailed(String),

    #[error("no keyframe found within the seek refinement window")]
    NoKeyframe,

    #[error("upstream size query failed: {0}")]
    UpstreamSizeUnavailable(String),

    #[error("pending-buffer overflow on PID {0}; entering DISCONT")]
    PesBufferOverflow(u16),
}

impl TsError {
    /// Errors that are expected to occur during normal operation and are
    /// recovered locally by the caller (bad packets dropped, PES overflow,
    /// a widened PCR-scan retry) rather than surfaced as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TsError::InvalidPacketSize(_)
                | TsError::InvalidSyncByte(_)
                | TsError::InsufficientData { .. }
                | TsError::DuplicatePacket { .. }
                | TsError::ContinuityError { .. }
                | TsError::PesBufferOverflow(_)
        )
    }

    /// Errors that must be surfaced to the caller rather than swallowed
    /// (per SPEC_FULL §7's "Surfaced" list).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TsError::PmtMissing { .. }
                | TsError::SeekFailed(_)
                | TsError::NoKeyframe
                | TsError::UpstreamSizeUnavailable(_)
                | TsError::MalformedTs(_)
        )
    }
}
