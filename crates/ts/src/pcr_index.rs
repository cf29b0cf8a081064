//! PCR indexer and byte-accurate seeker (SPEC_FULL §4.7, C7).
//!
//! The index is a sparse, strictly-ascending `(gsttime, pcr, byte_offset)`
//! table built once in pull mode and never mutated afterward (§5 "Shared
//! resource policy"). Seeking binary-searches the index for a bracketing
//! pair of samples, then iteratively narrows a byte-offset guess before a
//! final key-frame scan.

use bytes::Bytes;

use crate::config::PcrIndexConfig;
use crate::keyframe::{self, VideoCodec};
use crate::parser_zero_copy::TsParser;
use crate::pes_assembler::{pcr_to_ns, PCR_WRAP_27MHZ};
use crate::pes::PesHeader;
use crate::{Result, TsError};

const PACKET_SIZE: u64 = 188;

/// A source of TS bytes supporting random-access pull reads. Only used
/// during index build and seek refinement; steady-state demuxing never
/// suspends on this (SPEC_FULL §5).
pub trait ByteSource {
    fn size(&mut self) -> Result<u64>;
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes>;
}

/// A single `(gsttime, pcr, byte_offset)` anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrOffset {
    pub gsttime_ns: i64,
    pub pcr_27mhz: u64,
    pub offset: u64,
}

/// Seek refinement mode (SPEC_FULL §4.7 step 5 / §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFlag {
    /// Deliver the first keyframe at-or-before the target.
    KeyUnit,
    /// Deliver the first keyframe at-or-after the target.
    Accurate,
}

/// `calculate_gsttime(anchor, pcr)`: linear delta from `anchor`, with one
/// 33-bit wrap applied when `anchor.pcr > pcr`.
pub fn calculate_gsttime_ns(anchor_gsttime_ns: i64, anchor_pcr: u64, pcr: u64) -> i64 {
    if anchor_pcr > pcr {
        anchor_gsttime_ns + pcr_to_ns((pcr + PCR_WRAP_27MHZ) - anchor_pcr)
    } else {
        anchor_gsttime_ns + pcr_to_ns(pcr - anchor_pcr)
    }
}

/// Sparse PCR index plus the anchors used to build and seek it.
#[derive(Debug, Clone)]
pub struct PcrIndexer {
    entries: Vec<PcrOffset>,
    pub first_pcr: PcrOffset,
    pub last_pcr: PcrOffset,
    pub cur_pcr: Option<PcrOffset>,
    pub duration_ns: i64,
    pub pcr_pid: u16,
    pub video_pid: Option<u16>,
    pub video_codec: VideoCodec,
}

struct ProbeResult {
    #[allow(dead_code)]
    pat: crate::pat::Pat,
    pmt: crate::pmt::Pmt,
}

impl PcrIndexer {
    /// Build the index per SPEC_FULL §4.7 steps 1-5.
    pub fn build(
        source: &mut dyn ByteSource,
        program_number: i32,
        config: &PcrIndexConfig,
    ) -> Result<Self> {
        const PROBE_CHUNK_PACKETS: u64 = 50;
        let probe_chunk_bytes = (PROBE_CHUNK_PACKETS * PACKET_SIZE) as usize;

        let probe = Self::probe_pat_pmt(source, 0, program_number, probe_chunk_bytes, 400)?;
        let pcr_pid = probe.pmt.pcr_pid;
        let program = crate::program::Program::from_pmt(&probe.pmt);
        let video_pid = program.video_pid();
        let video_codec = video_pid
            .and_then(|pid| program.streams.get(&pid))
            .map(|s| VideoCodec::from_stream_type(s.stream_type))
            .unwrap_or(VideoCodec::Unknown);

        let first_samples =
            Self::sample_pcrs(source, 0, pcr_pid, probe_chunk_bytes * 8, 10)?;
        let first_raw = first_samples
            .first()
            .copied()
            .ok_or_else(|| TsError::MalformedTs("no PCR samples near start of stream".into()))?;
        let first_pcr = PcrOffset {
            gsttime_ns: pcr_to_ns(first_raw.1),
            pcr_27mhz: first_raw.1,
            offset: first_raw.0,
        };

        let size = source.size()?;
        let tail_bytes = 4000 * PACKET_SIZE;
        let tail_start = size.saturating_sub(tail_bytes);
        // Re-acquire PAT/PMT near the end in case of a program change; fall
        // back to the original program/PCR PID if none is found there.
        let _ = Self::probe_pat_pmt(source, tail_start, program_number, probe_chunk_bytes, 40);
        let last_samples = Self::sample_pcrs(source, tail_start, pcr_pid, tail_bytes as usize, 10)?;
        let last_raw = last_samples
            .last()
            .copied()
            .ok_or_else(|| TsError::MalformedTs("no PCR samples near end of stream".into()))?;
        let last_pcr = PcrOffset {
            gsttime_ns: calculate_gsttime_ns(first_pcr.gsttime_ns, first_pcr.pcr_27mhz, last_raw.1),
            pcr_27mhz: last_raw.1,
            offset: last_raw.0,
        };

        let mut entries = Vec::new();
        entries.push(first_pcr);
        let mut cursor = first_pcr.offset + config.wrap_stride_bytes;
        while cursor < last_pcr.offset {
            if let Some(sample) = Self::sample_one_pcr(source, cursor, pcr_pid, probe_chunk_bytes * 4)? {
                let gsttime_ns =
                    calculate_gsttime_ns(first_pcr.gsttime_ns, first_pcr.pcr_27mhz, sample.1);
                entries.push(PcrOffset {
                    gsttime_ns,
                    pcr_27mhz: sample.1,
                    offset: sample.0,
                });
            }
            cursor += config.wrap_stride_bytes;
        }
        if entries.last().copied() != Some(last_pcr) {
            entries.push(last_pcr);
        }
        entries.sort_by_key(|e| e.offset);
        entries.dedup_by_key(|e| e.offset);

        let duration_ns = last_pcr.gsttime_ns - first_pcr.gsttime_ns;

        Ok(PcrIndexer {
            entries,
            first_pcr,
            last_pcr,
            cur_pcr: None,
            duration_ns,
            pcr_pid,
            video_pid,
            video_codec,
        })
    }

    pub fn entries(&self) -> &[PcrOffset] {
        &self.entries
    }

    /// Observe a PCR sample during steady-state push-mode demuxing, used to
    /// keep `cur_pcr` current for seek-bound tightening (§4.7 step 3).
    pub fn observe_pcr(&mut self, pcr_27mhz: u64, offset: u64) {
        let gsttime_ns =
            calculate_gsttime_ns(self.first_pcr.gsttime_ns, self.first_pcr.pcr_27mhz, pcr_27mhz);
        self.cur_pcr = Some(PcrOffset {
            gsttime_ns,
            pcr_27mhz,
            offset,
        });
    }

    fn probe_pat_pmt(
        source: &mut dyn ByteSource,
        start_offset: u64,
        program_number: i32,
        chunk_bytes: usize,
        max_chunks: u32,
    ) -> Result<ProbeResult> {
        let mut parser = TsParser::new();
        let mut pat_found: Option<crate::pat::Pat> = None;
        let mut pmt_found: Option<crate::pmt::Pmt> = None;
        let mut offset = start_offset;
        for _ in 0..max_chunks {
            if pmt_found.is_some() {
                break;
            }
            let chunk = source.read_at(offset, chunk_bytes)?;
            if chunk.is_empty() {
                break;
            }
            let chunk_len = chunk.len() as u64;
            let mut pat_local = None;
            let mut pmt_local = None;
            parser.parse_packets(
                chunk,
                |pat_ref| {
                    pat_local = Some(crate::pat::Pat::from_ref(&pat_ref));
                    Ok(())
                },
                |pmt_ref| {
                    if let Ok(pmt) = crate::pmt::Pmt::from_ref(&pmt_ref)
                        && (program_number < 0 || pmt.program_number as i32 == program_number)
                    {
                        pmt_local = Some(pmt);
                    }
                    Ok(())
                },
                None::<fn(&crate::parser_zero_copy::TsPacketRef) -> Result<()>>,
            )?;
            if let Some(p) = pat_local {
                pat_found = Some(p);
            }
            if let Some(p) = pmt_local {
                pmt_found = Some(p);
            }
            offset += chunk_len;
        }
        let pat = pat_found
            .ok_or_else(|| TsError::MalformedTs("no PAT found while probing".into()))?;
        let pmt = pmt_found.ok_or(TsError::PmtMissing { program_number })?;
        Ok(ProbeResult { pat, pmt })
    }

    /// Collect up to `limit` PCR samples on `pcr_pid` starting at
    /// `start_offset`, each tagged with its approximate absolute byte
    /// offset (packet-count based, since the zero-copy parser does not
    /// expose per-packet offsets directly).
    fn sample_pcrs(
        source: &mut dyn ByteSource,
        start_offset: u64,
        pcr_pid: u16,
        scan_bytes: usize,
        limit: usize,
    ) -> Result<Vec<(u64, u64)>> {
        let chunk = source.read_at(start_offset, scan_bytes)?;
        let mut parser = TsParser::new();
        let mut samples = Vec::new();
        let mut packet_index: u64 = 0;
        parser.parse_packets(
            chunk,
            |_| Ok(()),
            |_| Ok(()),
            Some(|packet: &crate::parser_zero_copy::TsPacketRef| {
                if packet.pid == pcr_pid
                    && let Some(af) = packet.parse_adaptation_field()
                    && let Some(pcr) = af.pcr()
                    && samples.len() < limit
                {
                    let offset = start_offset + packet_index * PACKET_SIZE;
                    samples.push((offset, pcr.as_27mhz()));
                }
                packet_index += 1;
                Ok(())
            }),
        )?;
        Ok(samples)
    }

    fn sample_one_pcr(
        source: &mut dyn ByteSource,
        start_offset: u64,
        pcr_pid: u16,
        scan_bytes: usize,
    ) -> Result<Option<(u64, u64)>> {
        let samples = Self::sample_pcrs(source, start_offset, pcr_pid, scan_bytes, 1)?;
        Ok(samples.into_iter().next())
    }

    /// Binary-search the index for the `BEFORE` neighbour of `t_seek`,
    /// returning `(before, after)` indices bracketing it. Tightens with
    /// `cur_pcr` when it falls inside the bracket (§4.7 step 3).
    fn bracket(&self, t_seek_ns: i64) -> (PcrOffset, PcrOffset) {
        let mut lo = 0usize;
        let mut hi = self.entries.len() - 1;
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            if self.entries[mid].gsttime_ns <= t_seek_ns {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let mut before = self.entries[lo];
        let mut after = self.entries[hi];
        if let Some(cur) = self.cur_pcr
            && cur.gsttime_ns > before.gsttime_ns
            && cur.gsttime_ns < after.gsttime_ns
        {
            if cur.gsttime_ns <= t_seek_ns {
                before = cur;
            } else {
                after = cur;
            }
        }
        (before, after)
    }

    /// Seek to `t_req` per SPEC_FULL §4.7 steps 1-6. Returns the committed
    /// `(gsttime_ns, byte_offset)` of the chosen keyframe.
    pub fn seek(
        &self,
        source: &mut dyn ByteSource,
        t_req_ns: i64,
        flag: SeekFlag,
        config: &PcrIndexConfig,
    ) -> Result<(i64, u64)> {
        let video_pid = self
            .video_pid
            .ok_or_else(|| TsError::SeekFailed("no video PID configured".into()))?;

        let t_seek = t_req_ns - config.seek_timestamp_offset_ns + self.first_pcr.gsttime_ns;
        let (mut pcr_start, mut pcr_stop) = self.bracket(t_seek);

        let max_iterations = match flag {
            SeekFlag::Accurate => config.accurate_iterations,
            SeekFlag::KeyUnit => config.key_unit_iterations,
        };

        let mut narrowed_offset = pcr_start.offset;
        for iteration in 0..max_iterations {
            let span_time = (pcr_stop.gsttime_ns - pcr_start.gsttime_ns).max(1);
            let span_offset = pcr_stop.offset.saturating_sub(pcr_start.offset);
            let error_ns = (t_seek - pcr_start.gsttime_ns).abs().min((pcr_stop.gsttime_ns - t_seek).abs());
            if error_ns <= 500_000_000 || span_time <= 1_000_000_000 {
                break;
            }

            let ratio = if iteration % 2 == 1 {
                0.5
            } else {
                (t_seek - pcr_start.gsttime_ns) as f64 / span_time as f64
            };
            let guess_offset =
                pcr_start.offset + ((span_offset as f64) * ratio.clamp(0.0, 1.0)) as u64;
            narrowed_offset = guess_offset;

            let back_up = guess_offset.saturating_sub(config.scan_backup_packets * PACKET_SIZE);
            let found = Self::find_pcr_forward(
                source,
                back_up,
                self.pcr_pid,
                config.scan_window_packets,
            )?
            .or(Self::find_pcr_forward(
                source,
                back_up,
                self.pcr_pid,
                config.scan_window_packets_wide,
            )?);

            let Some((found_offset, found_pcr)) = found else {
                continue;
            };
            let found_gsttime =
                calculate_gsttime_ns(self.first_pcr.gsttime_ns, self.first_pcr.pcr_27mhz, found_pcr);
            if found_gsttime < pcr_start.gsttime_ns || found_gsttime > pcr_stop.gsttime_ns {
                continue;
            }
            narrowed_offset = found_offset;
            if found_gsttime <= t_seek {
                pcr_start = PcrOffset {
                    gsttime_ns: found_gsttime,
                    pcr_27mhz: found_pcr,
                    offset: found_offset,
                };
            } else {
                pcr_stop = PcrOffset {
                    gsttime_ns: found_gsttime,
                    pcr_27mhz: found_pcr,
                    offset: found_offset,
                };
            }
        }

        // Scan forward from the narrowed guess at least as far as the
        // bracketing pair's own span, bounded below by one wide window.
        let bracket_span = pcr_stop.offset.saturating_sub(narrowed_offset);
        let scan_limit = bracket_span.max(config.scan_window_packets_wide * PACKET_SIZE);

        self.refine_to_keyframe(source, narrowed_offset, scan_limit, video_pid, t_seek, flag)
    }

    fn find_pcr_forward(
        source: &mut dyn ByteSource,
        from_offset: u64,
        pcr_pid: u16,
        window_packets: u64,
    ) -> Result<Option<(u64, u64)>> {
        Self::sample_one_pcr(source, from_offset, pcr_pid, (window_packets * PACKET_SIZE) as usize)
    }

    fn refine_to_keyframe(
        &self,
        source: &mut dyn ByteSource,
        from_offset: u64,
        scan_bytes: u64,
        video_pid: u16,
        t_seek_ns: i64,
        flag: SeekFlag,
    ) -> Result<(i64, u64)> {
        let chunk = source.read_at(from_offset, scan_bytes as usize)?;
        let mut parser = TsParser::new();
        let mut last_pts: Option<u64> = None;
        let mut best: Option<(i64, u64)> = None;
        let mut packet_index: u64 = 0;
        let mut pending = Vec::<u8>::new();
        let mut pending_start_offset = from_offset;

        parser.parse_packets(
            chunk,
            |_| Ok(()),
            |_| Ok(()),
            Some(|packet: &crate::parser_zero_copy::TsPacketRef| {
                if packet.pid != video_pid {
                    packet_index += 1;
                    return Ok(());
                }
                if packet.payload_unit_start_indicator {
                    pending.clear();
                    pending_start_offset = from_offset + packet_index * PACKET_SIZE;
                }
                if let Some(payload) = packet.payload() {
                    pending.extend_from_slice(&payload);
                }
                if let Ok(header) = PesHeader::parse(&pending) {
                    let es = &pending[header.payload_offset..];
                    if keyframe::is_keyframe(self.video_codec, es)
                        && let Some(pts) = header.pts
                    {
                        last_pts = Some(pts);
                        let gsttime = calculate_gsttime_ns(
                            self.first_pcr.gsttime_ns,
                            self.first_pcr.pcr_27mhz,
                            pts * 300,
                        );
                        let candidate = (gsttime, pending_start_offset);
                        let accept = match flag {
                            SeekFlag::KeyUnit => best.is_none(),
                            SeekFlag::Accurate => gsttime >= t_seek_ns && best.is_none(),
                        };
                        if accept {
                            best = Some(candidate);
                        }
                    }
                }
                packet_index += 1;
                Ok(())
            }),
        )?;
        let _ = last_pts;
        best.ok_or(TsError::NoKeyframe)
    }
}
