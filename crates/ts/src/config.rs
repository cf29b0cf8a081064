//! Configuration knobs for the demultiplexer & indexer (TSD).

/// Configuration for [`crate::pes_assembler::PesAssembler`] and the owning
/// demux session.
///
/// Mirrors the element-property idiom used throughout the teacher crate's
/// `HlsConfig`/`HlsPlaylistConfig` nested structs: one `Default` impl per
/// concern, aggregated into a single top-level config the caller constructs
/// once per stream.
#[derive(Debug, Clone)]
pub struct TsDemuxConfig {
    /// Which program to demux. `-1` means "first program seen" (auto).
    pub program_number: i32,
    /// When set, PCR/OPCR/PTS/DTS sightings are published as out-of-band
    /// structured stats messages (`{pid, offset, pcr|opcr|pts|dts}`).
    pub emit_stats: bool,
    /// Maximum pending PES packets buffered per PID before the assembler
    /// gives up and enters `DISCONT` (SPEC_FULL §4.6).
    pub pes_pending_buffer_cap: usize,
}

impl Default for TsDemuxConfig {
    fn default() -> Self {
        Self {
            program_number: -1,
            emit_stats: false,
            pes_pending_buffer_cap: 256,
        }
    }
}

/// Configuration for [`crate::pcr_index::PcrIndexer`] and seek refinement.
#[derive(Debug, Clone)]
pub struct PcrIndexConfig {
    /// Sparse sampling stride while building the index, in bytes. Roughly
    /// "every 128-KBps PCR-wrap window" per SPEC_FULL §4.7 (~1.5 GiB).
    pub wrap_stride_bytes: u64,
    /// `SEEK_TIMESTAMP_OFFSET`: subtracted from the requested seek time
    /// before binary search, to bias toward landing on a keyframe at or
    /// before the target.
    pub seek_timestamp_offset_ns: i64,
    /// Bisection iteration cap for `accurate` seeks.
    pub accurate_iterations: u32,
    /// Bisection iteration cap for non-`accurate` (key-unit) seeks.
    pub key_unit_iterations: u32,
    /// Packets to back up before the first keyframe scan window.
    pub scan_backup_packets: u64,
    /// Initial forward scan window, in packets.
    pub scan_window_packets: u64,
    /// Widened forward scan window if the first one misses, in packets.
    pub scan_window_packets_wide: u64,
}

/// ~1.5 GiB, matching SPEC_FULL §4.7's `PCR_WRAP_SIZE_128KBPS` stride.
pub const PCR_WRAP_SIZE_128KBPS: u64 = 1_500 * 1024 * 1024;

impl Default for PcrIndexConfig {
    fn default() -> Self {
        Self {
            wrap_stride_bytes: PCR_WRAP_SIZE_128KBPS,
            seek_timestamp_offset_ns: 1_000_000_000,
            accurate_iterations: 25,
            key_unit_iterations: 10,
            scan_backup_packets: 55,
            scan_window_packets: 4_000,
            scan_window_packets_wide: 8_000,
        }
    }
}
