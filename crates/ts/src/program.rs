//! Program model (SPEC_FULL §3 "Program Model (C5)").
//!
//! Elementary streams are modeled as a `PID -> StreamHandle` map per the
//! design note in §9 ("Dynamic pad creation"); `StreamHandle` is a tagged
//! variant over media kinds so the demux layer can name/create a downstream
//! output (e.g. `video_0041`) without re-deriving the kind from `stream_type`
//! at every call site.

use bytes::Bytes;

use crate::pmt::{Pmt, PmtStream, StreamType};

/// Coarse media kind derived from a [`StreamType`], used to name dynamically
/// created outputs (`{kind}_{pid:04x}`) and to pick the PCR seeker's
/// key-frame detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

impl From<StreamType> for MediaKind {
    fn from(value: StreamType) -> Self {
        if value.is_video() {
            MediaKind::Video
        } else if value.is_audio() {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }
}

/// One elementary stream inside a [`Program`].
#[derive(Debug, Clone)]
pub struct ElementaryStream {
    pub pid: u16,
    pub stream_type: StreamType,
    pub descriptors: Bytes,
    pub kind: MediaKind,
}

impl ElementaryStream {
    fn from_pmt_stream(s: &PmtStream) -> Self {
        ElementaryStream {
            pid: s.elementary_pid,
            stream_type: s.stream_type,
            descriptors: s.es_info.clone(),
            kind: MediaKind::from(s.stream_type),
        }
    }

    /// Output name a dynamic pad would use, e.g. `video_0041`.
    pub fn output_name(&self) -> String {
        let kind = match self.kind {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Other => "other",
        };
        format!("{kind}_{:04x}", self.pid)
    }
}

/// One active program: its PCR PID and its elementary streams, keyed by PID.
#[derive(Debug, Clone)]
pub struct Program {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub streams: std::collections::BTreeMap<u16, ElementaryStream>,
}

impl Program {
    pub fn from_pmt(pmt: &Pmt) -> Self {
        let streams = pmt
            .streams
            .iter()
            .map(|s| (s.elementary_pid, ElementaryStream::from_pmt_stream(s)))
            .collect();
        Program {
            program_number: pmt.program_number,
            pcr_pid: pmt.pcr_pid,
            streams,
        }
    }

    pub fn video_pid(&self) -> Option<u16> {
        self.streams
            .values()
            .find(|s| s.kind == MediaKind::Video)
            .map(|s| s.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmt::{Pmt, PmtStream};

    fn pmt(pcr_pid: u16, streams: Vec<(StreamType, u16)>) -> Pmt {
        Pmt {
            table_id: 0x02,
            program_number: 1,
            version_number: 0,
            current_next_indicator: true,
            section_number: 0,
            last_section_number: 0,
            pcr_pid,
            program_info: Bytes::new(),
            streams: streams
                .into_iter()
                .map(|(stream_type, elementary_pid)| PmtStream {
                    stream_type,
                    elementary_pid,
                    es_info: Bytes::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn builds_program_from_pmt() {
        let p = pmt(0x100, vec![(StreamType::H264, 0x101), (StreamType::Aac, 0x102)]);
        let program = Program::from_pmt(&p);
        assert_eq!(program.pcr_pid, 0x100);
        assert_eq!(program.streams.len(), 2);
        assert_eq!(program.video_pid(), Some(0x101));
        assert_eq!(program.streams[&0x101].output_name(), "video_0101");
        assert_eq!(program.streams[&0x102].output_name(), "audio_0102");
    }
}
