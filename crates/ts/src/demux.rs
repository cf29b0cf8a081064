//! Composition root tying the packetizer + PSI + program table (`TsCore`)
//! to PES assembly and PCR anchoring (`TsDemux`), per the §9 design note:
//! "a `TsCore` owns packetizer + PSI + program table; `TsDemux` holds a
//! `TsCore` and layers PES assembly + indexing on top. Shared operations
//! ... are methods on `TsCore`, not virtual calls."

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::{PcrIndexConfig, TsDemuxConfig};
use crate::parser_zero_copy::{TsPacketRef, TsParser};
use crate::pcr_index::{calculate_gsttime_ns, ByteSource, PcrIndexer, SeekFlag};
use crate::pes_assembler::{pcr_to_ns, PcrAnchor, PesAssembler, PesUnit};
use crate::pmt::Pmt;
use crate::program::Program;
use crate::{Result, TsError};

const PACKET_SIZE: u64 = 188;

/// Stream-added/removed notification, computed from a PMT diff (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramEvent {
    StreamAdded { pid: u16 },
    StreamRemoved { pid: u16 },
}

/// Segment boundary descriptor emitted on the first buffer pushed after a
/// seek or startup (§4.6 "First-flush segment event").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSegmentEvent {
    pub start_ns: i64,
    pub stop_ns: i64,
    pub time_ns: i64,
}

/// What one call to [`TsDemux::push`] produced, in the order the teacher's
/// push-mode elements report them: program changes first, then the
/// first-flush new-segment marker (at most once per discontinuity), then
/// reassembled PES units.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    Program(ProgramEvent),
    NewSegment(NewSegmentEvent),
    Pes(PesUnit),
}

/// Counters independent of the `tracing` event stream (§3.1 ambient
/// addition), so a caller can poll without installing a subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsDemuxStats {
    pub packets_seen: u64,
    pub psi_sections_parsed: u64,
    pub pes_payloads_emitted: u64,
    pub continuity_errors: u64,
}

/// Packetizer + PSI + program-table layer.
pub struct TsCore {
    parser: TsParser,
    program_number: i32,
    program: Option<Program>,
    active_pmt: Option<Pmt>,
}

impl TsCore {
    pub fn new(program_number: i32) -> Self {
        Self::with_config(&TsDemuxConfig {
            program_number,
            ..TsDemuxConfig::default()
        })
    }

    pub fn with_config(config: &TsDemuxConfig) -> Self {
        Self {
            // §4.5: the PSI Handler unconditionally validates section
            // length and CRC-32/MPEG-2; this isn't one of the knobs §6
            // exposes, so it's not configurable here.
            parser: TsParser::new()
                .with_crc_validation(true)
                .with_continuity_mode(crate::packet::ContinuityMode::Warn),
            program_number: config.program_number,
            program: None,
            active_pmt: None,
        }
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// Feed one chunk of bytes. `on_packet` is invoked for every parsed
    /// packet so the caller can drive PES assembly off the same pass.
    fn push(
        &mut self,
        data: Bytes,
        mut on_packet: impl FnMut(&TsPacketRef),
    ) -> Result<(Vec<ProgramEvent>, u64)> {
        let mut events = Vec::new();
        let program_number = self.program_number;
        let mut new_pmt: Option<Pmt> = None;
        let mut psi_sections = 0u64;

        self.parser.parse_packets(
            data,
            |_pat_ref| {
                psi_sections += 1;
                Ok(())
            },
            |pmt_ref| {
                psi_sections += 1;
                if let Ok(pmt) = Pmt::from_ref(&pmt_ref)
                    && (program_number < 0 || pmt.program_number as i32 == program_number)
                {
                    new_pmt = Some(pmt);
                }
                Ok(())
            },
            Some(|packet: &TsPacketRef| {
                on_packet(packet);
                Ok(())
            }),
        )?;

        if let Some(pmt) = new_pmt {
            match &self.active_pmt {
                Some(previous) => {
                    let diff = pmt.diff(previous);
                    for s in &diff.added {
                        events.push(ProgramEvent::StreamAdded { pid: s.elementary_pid });
                    }
                    for pid in &diff.removed {
                        events.push(ProgramEvent::StreamRemoved { pid: *pid });
                    }
                }
                None => {
                    for s in &pmt.streams {
                        events.push(ProgramEvent::StreamAdded { pid: s.elementary_pid });
                    }
                }
            }
            self.program = Some(Program::from_pmt(&pmt));
            self.active_pmt = Some(pmt);
        }

        Ok((events, psi_sections))
    }
}

/// Demultiplexer & indexer session: one per active TS stream.
///
/// Elementary streams are modeled as dynamic pads created lazily on first
/// sighting (§4.6 implementation note) rather than eagerly for all 8192
/// PIDs, so `assemblers` is a sparse map, not a `[_; PID_SPACE]` table.
pub struct TsDemux {
    core: TsCore,
    config: TsDemuxConfig,
    assemblers: HashMap<u16, PesAssembler>,
    first_pcr: Option<PcrAnchor>,
    cur_pcr: Option<PcrAnchor>,
    segment_start_ns: i64,
    segment_duration_ns: i64,
    segment_time_ns: i64,
    new_segment_pending: bool,
    stats: TsDemuxStats,
    indexer: Option<PcrIndexer>,
}

impl TsDemux {
    pub fn new(config: TsDemuxConfig) -> Self {
        let core = TsCore::with_config(&config);
        Self {
            core,
            config,
            assemblers: HashMap::new(),
            first_pcr: None,
            cur_pcr: None,
            segment_start_ns: 0,
            segment_duration_ns: 0,
            segment_time_ns: 0,
            new_segment_pending: true,
            stats: TsDemuxStats::default(),
            indexer: None,
        }
    }

    pub fn stats(&self) -> TsDemuxStats {
        self.stats
    }

    pub fn program(&self) -> Option<&Program> {
        self.core.program()
    }

    /// Build the C7 seek index over `source` (SPEC_FULL §4.7 steps 1-5).
    /// Required once, in pull mode, before [`TsDemux::seek`] will succeed;
    /// push-mode demuxing is unaffected either way.
    pub fn build_index(&mut self, source: &mut dyn ByteSource, config: &PcrIndexConfig) -> Result<()> {
        self.indexer = Some(PcrIndexer::build(source, self.config.program_number, config)?);
        Ok(())
    }

    pub fn indexer(&self) -> Option<&PcrIndexer> {
        self.indexer.as_ref()
    }

    /// Seek to `t_seek_ns` per SPEC_FULL §4.7 step 6, returning the
    /// committed `(gsttime_ns, byte_offset)` of the chosen keyframe.
    ///
    /// Requires [`TsDemux::build_index`] to have run first. On success,
    /// flushes pending per-PID PES state and arms a new first-flush segment
    /// event, since the caller is expected to reposition `source` at the
    /// returned offset and resume pushing from there. Segment/assembler
    /// state is left untouched if the seek fails (§7).
    pub fn seek(
        &mut self,
        source: &mut dyn ByteSource,
        t_seek_ns: i64,
        flag: SeekFlag,
        config: &PcrIndexConfig,
    ) -> Result<(i64, u64)> {
        let indexer = self
            .indexer
            .as_ref()
            .ok_or_else(|| TsError::SeekFailed("no index built; call build_index first".into()))?;
        let (gsttime_ns, offset) = indexer.seek(source, t_seek_ns, flag, config)?;
        self.flush();
        self.assemblers.clear();
        self.cur_pcr = None;
        self.new_segment_pending = true;
        Ok((gsttime_ns, offset))
    }

    /// Set the segment bounds (`start`, `duration`, `time`) used to build
    /// the next first-flush [`NewSegmentEvent`] (§4.6). Also marks a new
    /// first-flush as pending, as happens after a seek.
    pub fn set_segment(&mut self, start_ns: i64, duration_ns: i64, time_ns: i64) {
        self.segment_start_ns = start_ns;
        self.segment_duration_ns = duration_ns;
        self.segment_time_ns = time_ns;
        self.new_segment_pending = true;
    }

    /// Flush every per-PID assembler, discarding partial PES data. Call
    /// before a seek so no stale payload leaks into the post-seek stream.
    pub fn flush(&mut self) -> Vec<PesUnit> {
        self.assemblers
            .values_mut()
            .filter_map(PesAssembler::finish)
            .collect()
    }

    /// Feed one chunk of raw TS bytes, returning demux events in report
    /// order (program changes, then first-flush, then PES units).
    pub fn push(&mut self, data: Bytes) -> Result<Vec<DemuxEvent>> {
        let mut pes_units: Vec<(u16, Vec<PesUnit>)> = Vec::new();
        let emit_stats = self.config.emit_stats;
        let pending_cap = self.config.pes_pending_buffer_cap;
        let assemblers = &mut self.assemblers;
        let mut first_pcr = self.first_pcr;
        let mut cur_pcr = self.cur_pcr;
        let mut indexer = self.indexer.take();
        let base_packets_seen = self.stats.packets_seen;
        let mut packets_seen = 0u64;
        let mut continuity_errors = 0u64;

        let push_result = self.core.push(data, |packet: &TsPacketRef| {
            let packet_index = packets_seen;
            packets_seen += 1;

            if let Some(af) = packet.parse_adaptation_field()
                && let Some(pcr) = af.pcr()
            {
                let pcr_27mhz = pcr.as_27mhz();
                let anchor = first_pcr.get_or_insert(PcrAnchor {
                    gsttime_ns: pcr_to_ns(pcr_27mhz),
                    pcr_27mhz,
                });
                let gsttime_ns = calculate_gsttime_ns(anchor.gsttime_ns, anchor.pcr_27mhz, pcr_27mhz);
                cur_pcr = Some(PcrAnchor { gsttime_ns, pcr_27mhz });
                if let Some(idx) = indexer.as_mut() {
                    idx.observe_pcr(pcr_27mhz, (base_packets_seen + packet_index) * PACKET_SIZE);
                }
                if emit_stats {
                    debug!(target: "ts::stats", pid = packet.pid, pcr = pcr_27mhz, "pcr sighting");
                }
            }

            if let Some(payload) = packet.payload() {
                let assembler = assemblers
                    .entry(packet.pid)
                    .or_insert_with(|| PesAssembler::new(packet.pid, pending_cap));
                match assembler.push(packet.payload_unit_start_indicator, payload) {
                    Ok(units) if !units.is_empty() => pes_units.push((packet.pid, units)),
                    Ok(_) => {}
                    Err(_) => continuity_errors += 1,
                }
                if emit_stats
                    && let Some(pts) = assembler.last_pts
                {
                    debug!(target: "ts::stats", pid = packet.pid, pts, "pts sighting");
                }
            }
        });

        // Write local state back to `self` unconditionally (`indexer` was
        // `take()`n above and must not be dropped on the error path below).
        self.first_pcr = first_pcr;
        self.cur_pcr = cur_pcr;
        self.indexer = indexer;
        let (program_events, psi_sections) = push_result?;
        self.stats.packets_seen += packets_seen;
        self.stats.psi_sections_parsed += psi_sections;
        self.stats.continuity_errors += continuity_errors;

        let mut events: Vec<DemuxEvent> = program_events
            .into_iter()
            .map(|e| {
                if let ProgramEvent::StreamRemoved { pid } = e {
                    warn!(pid, "stream removed");
                }
                DemuxEvent::Program(e)
            })
            .collect();

        let flat_units: Vec<PesUnit> = pes_units.into_iter().flat_map(|(_, us)| us).collect();

        if self.new_segment_pending
            && !flat_units.is_empty()
            && let Some(anchor) = self.first_pcr
        {
            events.push(DemuxEvent::NewSegment(NewSegmentEvent {
                start_ns: anchor.gsttime_ns + self.segment_start_ns,
                stop_ns: anchor.gsttime_ns + self.segment_duration_ns,
                time_ns: self.segment_time_ns,
            }));
            self.new_segment_pending = false;
        }

        self.stats.pes_payloads_emitted += flat_units.len() as u64;
        events.extend(flat_units.into_iter().map(DemuxEvent::Pes));

        Ok(events)
    }
}
