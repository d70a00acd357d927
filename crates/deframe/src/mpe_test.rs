//! Tests for the MPE deframer

use super::*;

const PID: u16 = 1234;

fn config() -> MpeConfig {
    MpeConfig {
        pid: PID,
        ip: Ipv4Addr::new(239, 10, 0, 1),
        port: 12000,
    }
}

/// Build one MPE section carrying an IPv4/UDP packet towards dst.
fn section(dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let body_len = MPE_HEADER_LEN - PSI_HEADER_SIZE + IPV4_HEADER_LEN + udp_len + 4;

    let mut s = Vec::new();
    s.push(MPE_TABLE_ID);
    s.push(0xb0 | ((body_len >> 8) & 0x0f) as u8);
    s.push((body_len & 0xff) as u8);
    // MAC address fields and section numbering
    s.extend_from_slice(&[0x01, 0x02, 0x00, 0x00, 0x00, 0x03, 0x04, 0x05, 0x06]);

    // IPv4 header
    let total_len = (IPV4_HEADER_LEN + udp_len) as u16;
    s.push(0x45);
    s.push(0x00);
    s.extend_from_slice(&total_len.to_be_bytes());
    s.extend_from_slice(&[0, 0, 0, 0]); // id, flags
    s.push(64); // ttl
    s.push(17); // UDP
    s.extend_from_slice(&[0, 0]); // checksum
    s.extend_from_slice(&[10, 0, 0, 1]); // src
    s.extend_from_slice(&dst.octets());

    // UDP header
    s.extend_from_slice(&9000u16.to_be_bytes());
    s.extend_from_slice(&dst_port.to_be_bytes());
    s.extend_from_slice(&(udp_len as u16).to_be_bytes());
    s.extend_from_slice(&[0, 0]);

    s.extend_from_slice(payload);
    s.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // section CRC32
    s
}

/// Packetise a section into TS packets on `pid`.
fn packetise(section: &[u8], pid: u16, first_cc: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut remaining = section;
    let mut cc = first_cc;
    let mut first = true;

    while !remaining.is_empty() || first {
        let mut ts = vec![0u8; TS_PACKET_SIZE];
        ts[0] = TS_SYNC;
        ts[1] = ((pid >> 8) & 0x1f) as u8 | if first { 0x40 } else { 0x00 };
        ts[2] = (pid & 0xff) as u8;
        ts[3] = 0x10 | (cc & 0x0f);

        let mut pos = 4;
        if first {
            ts[pos] = 0; // pointer field
            pos += 1;
        }
        let take = remaining.len().min(TS_PACKET_SIZE - pos);
        ts[pos..pos + take].copy_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        for byte in ts.iter_mut().skip(pos + take) {
            *byte = 0xff;
        }

        out.extend_from_slice(&ts);
        cc = (cc + 1) & 0x0f;
        first = false;
    }
    out
}

#[test]
fn spec_parsing() {
    let config = MpeConfig::from_spec("1234:239.10.0.1:12000").unwrap();
    assert_eq!(config.pid, 1234);
    assert_eq!(config.ip, Ipv4Addr::new(239, 10, 0, 1));
    assert_eq!(config.port, 12000);

    assert!(MpeConfig::from_spec("1234:239.10.0.1").is_err());
    assert!(MpeConfig::from_spec("x:y:z").is_err());
}

#[test]
fn extracts_edi_from_single_ts_packet() {
    let payload = b"small edi frame".to_vec();
    let ts = packetise(&section(config().ip, config().port, &payload), PID, 0);

    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(&ts);

    assert_eq!(deframer.take_deframed(), vec![payload]);
}

#[test]
fn reassembles_sections_spanning_ts_packets() {
    let payload: Vec<u8> = (0..300u16).map(|i| (i % 251) as u8).collect();
    let ts = packetise(&section(config().ip, config().port, &payload), PID, 5);
    assert!(ts.len() > TS_PACKET_SIZE);

    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(&ts);

    assert_eq!(deframer.take_deframed(), vec![payload]);
}

#[test]
fn wrong_pid_is_ignored() {
    let payload = b"edi".to_vec();
    let ts = packetise(&section(config().ip, config().port, &payload), PID + 1, 0);

    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(&ts);
    assert!(deframer.take_deframed().is_empty());
}

#[test]
fn wrong_destination_is_filtered() {
    let other_ip = Ipv4Addr::new(239, 10, 0, 2);
    let ts = packetise(&section(other_ip, config().port, b"edi"), PID, 0);
    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(&ts);
    assert!(deframer.take_deframed().is_empty());

    let ts = packetise(&section(config().ip, 9999, b"edi"), PID, 0);
    deframer.process_packet(&ts);
    assert!(deframer.take_deframed().is_empty());
}

#[test]
fn continuity_gap_drops_the_section() {
    let payload: Vec<u8> = (0..600u16).map(|i| (i % 251) as u8).collect();
    let ts = packetise(&section(config().ip, config().port, &payload), PID, 0);
    let packets: Vec<&[u8]> = ts.chunks(TS_PACKET_SIZE).collect();
    assert!(packets.len() >= 3);

    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(packets[0]);
    // skip the middle packets: continuity broken
    deframer.process_packet(packets[packets.len() - 1]);
    assert!(deframer.take_deframed().is_empty());
}

#[test]
fn odd_sized_datagrams_are_skipped() {
    let mut deframer = MpeDeframer::new(config());
    deframer.process_packet(&[0x47; 100]);
    assert!(deframer.take_deframed().is_empty());
}
