//! Byte-exact packet framing: SPEC_FULL §8 scenario 5. A buffer carrying
//! some leading noise before the real packet stream must resync on the
//! first *aligned* triple-188-byte sync pattern, not on any lone 0x47 byte
//! that happens to precede it.

use bytes::Bytes;
use ts::{TsPacketRef, TsParser};

/// A single minimal TS packet: sync byte, PID, payload-only AFC, then a
/// continuity counter, with the rest filled with a byte that never
/// collides with the sync byte (0x47).
fn build_packet(pid: u16, cc: u8) -> Vec<u8> {
    let mut packet = vec![0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = ((pid >> 8) & 0x1F) as u8;
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10 | (cc & 0x0F);
    packet
}

#[test]
fn resyncs_on_first_aligned_triple_sync_and_returns_exactly_three_packets() {
    // 16 bytes that are never mistaken for a sync byte, then a 17th byte
    // that is a sync byte but does not start a real packet (the next
    // byte 188 bytes later isn't itself a sync byte).
    let mut data = vec![0x00u8; 16];
    data.push(0x47);
    assert_eq!(data.len(), 17);

    data.extend(build_packet(0x0101, 0));
    data.extend(build_packet(0x0101, 1));
    data.extend(build_packet(0x0101, 2));
    assert_eq!(data.len(), 17 + 3 * 188);

    let mut parser = TsParser::new();
    let mut seen_ccs = Vec::new();
    parser
        .parse_packets(
            Bytes::from(data),
            |_| Ok(()),
            |_| Ok(()),
            Some(|packet: &TsPacketRef| {
                seen_ccs.push(packet.continuity_counter);
                Ok(())
            }),
        )
        .unwrap();

    assert_eq!(seen_ccs, vec![0, 1, 2]);
}
