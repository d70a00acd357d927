//! Tests for the GSE deframer

use super::*;

const MIS: u8 = 5;

fn config() -> GseConfig {
    GseConfig {
        mis: MIS,
        filter: Some((Ipv4Addr::new(239, 20, 0, 1), 13000)),
    }
}

/// IPv4/UDP PDU whose UDP payload is `edi`; extraction strips the IP and
/// UDP headers.
fn ipv4_udp_pdu(dst: Ipv4Addr, port: u16, edi: &[u8]) -> Vec<u8> {
    let udp_len = 8 + edi.len();
    let mut pdu = Vec::new();
    pdu.push(0x45);
    pdu.push(0x00);
    pdu.extend_from_slice(&((20 + udp_len) as u16).to_be_bytes());
    pdu.extend_from_slice(&[0, 0, 0, 0]);
    pdu.push(64);
    pdu.push(17);
    pdu.extend_from_slice(&[0, 0]);
    pdu.extend_from_slice(&[10, 0, 0, 2]);
    pdu.extend_from_slice(&dst.octets());
    pdu.extend_from_slice(&9000u16.to_be_bytes());
    pdu.extend_from_slice(&port.to_be_bytes());
    pdu.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pdu.extend_from_slice(&[0, 0]);
    pdu.extend_from_slice(edi);
    pdu
}

/// Unfragmented GSE packet (start and end set, no label).
fn gse_single(pdu: &[u8]) -> Vec<u8> {
    let gse_length = 2 + pdu.len();
    let mut packet = Vec::new();
    packet.push(0x80 | 0x40 | 0x20 | ((gse_length >> 8) & 0x0f) as u8);
    packet.push((gse_length & 0xff) as u8);
    packet.extend_from_slice(&0x0800u16.to_be_bytes());
    packet.extend_from_slice(pdu);
    packet
}

/// BBFrame around `gse_packets`, packetised into RTP + TS.
fn rtp_ts(mis: u8, gse_packets: &[u8]) -> Vec<u8> {
    let mut data_field = gse_packets.to_vec();
    data_field.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // data field CRC32

    let mut bbframe = vec![0xb8u8];
    let dfl_bits = (data_field.len() * 8) as u16;
    let mut header = [0u8; 10];
    header[1] = mis; // MaType2
    header[4] = (dfl_bits >> 8) as u8;
    header[5] = (dfl_bits & 0xff) as u8;
    bbframe.extend_from_slice(&header);
    bbframe.extend_from_slice(&data_field);

    // one private section per TS packet, 180 payload bytes in the header
    // packet, 179 in continuations
    let mut out = vec![0x80, 0x21, 0, 1, 0, 0, 0, 0, 0x0f, 0x0f, 0x0f, 0x0f];
    let mut remaining = bbframe.as_slice();
    let mut counter = 1u8;
    let mut first = true;
    while !remaining.is_empty() {
        let mut ts = vec![0xffu8; TS_PACKET_SIZE];
        ts[0] = 0x47;
        ts[1] = 0x41;
        ts[2] = 0x0e;
        ts[3] = 0x10;
        ts[4] = 0x00;
        ts[5] = 0x80;
        ts[6] = 0x00;
        if first {
            let take = remaining.len().min(180);
            ts[7] = take as u8;
            ts[8..8 + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            first = false;
        } else {
            let take = remaining.len().min(179);
            ts[7] = (take + 1) as u8;
            ts[8] = counter;
            counter = counter.wrapping_add(1);
            ts[9..9 + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
        }
        out.extend_from_slice(&ts);
    }
    out
}

#[test]
fn spec_parsing() {
    let bare = GseConfig::from_spec("5").unwrap();
    assert_eq!(bare.mis, 5);
    assert!(bare.filter.is_none());

    let filtered = GseConfig::from_spec("5:239.20.0.1:13000").unwrap();
    assert_eq!(
        filtered.filter,
        Some((Ipv4Addr::new(239, 20, 0, 1), 13000))
    );

    assert!(GseConfig::from_spec("5:239.20.0.1").is_err());
    assert!(GseConfig::from_spec("not-a-mis").is_err());
}

#[test]
fn extracts_unfragmented_pdu() {
    let edi = b"one small edi frame".to_vec();
    let pdu = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 13000, &edi);
    let datagram = rtp_ts(MIS, &gse_single(&pdu));

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&datagram);
    assert_eq!(deframer.take_deframed(), vec![edi]);
}

#[test]
fn bbframe_spanning_ts_packets() {
    let edi: Vec<u8> = (0..400u16).map(|i| (i % 251) as u8).collect();
    let pdu = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 13000, &edi);
    let datagram = rtp_ts(MIS, &gse_single(&pdu));
    assert!(datagram.len() > 12 + 2 * TS_PACKET_SIZE);

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&datagram);
    assert_eq!(deframer.take_deframed(), vec![edi]);
}

#[test]
fn foreign_mis_is_discarded() {
    let edi = b"frame".to_vec();
    let pdu = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 13000, &edi);
    let datagram = rtp_ts(MIS + 1, &gse_single(&pdu));

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&datagram);
    assert!(deframer.take_deframed().is_empty());

    // and the deframer is still in sync for the next matching BBFrame
    let datagram = rtp_ts(MIS, &gse_single(&pdu));
    deframer.process_packet(&datagram);
    assert_eq!(deframer.take_deframed(), vec![edi]);
}

#[test]
fn flow_filter_applies() {
    let edi = b"frame".to_vec();
    let wrong_ip = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 9), 13000, &edi);
    let wrong_port = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 9999, &edi);

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&rtp_ts(MIS, &gse_single(&wrong_ip)));
    deframer.process_packet(&rtp_ts(MIS, &gse_single(&wrong_port)));
    assert!(deframer.take_deframed().is_empty());

    // without a filter everything flows
    let mut open = GseDeframer::new(GseConfig {
        mis: MIS,
        filter: None,
    });
    open.process_packet(&rtp_ts(MIS, &gse_single(&wrong_ip)));
    assert_eq!(open.take_deframed().len(), 1);
}

#[test]
fn fragmented_pdu_reassembles() {
    let edi: Vec<u8> = (0..120u16).map(|i| i as u8).collect();
    let pdu = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 13000, &edi);

    let (p1, rest) = pdu.split_at(50);
    let (p2, p3) = rest.split_at(60);
    let frag_id = 7u8;

    // start fragment: frag id, total length, protocol, first slice
    let mut start = Vec::new();
    let len = 5 + p1.len();
    start.push(0x80 | 0x20 | ((len >> 8) & 0x0f) as u8);
    start.push((len & 0xff) as u8);
    start.push(frag_id);
    start.extend_from_slice(&(pdu.len() as u16).to_be_bytes());
    start.extend_from_slice(&0x0800u16.to_be_bytes());
    start.extend_from_slice(p1);

    // continuation
    let mut middle = Vec::new();
    let len = 1 + p2.len();
    middle.push(0x20 | ((len >> 8) & 0x0f) as u8);
    middle.push((len & 0xff) as u8);
    middle.push(frag_id);
    middle.extend_from_slice(p2);

    // end fragment carries the CRC32 tail
    let mut end = Vec::new();
    let len = 1 + p3.len() + 4;
    end.push(0x40 | 0x20 | ((len >> 8) & 0x0f) as u8);
    end.push((len & 0xff) as u8);
    end.push(frag_id);
    end.extend_from_slice(p3);
    end.extend_from_slice(&[1, 2, 3, 4]);

    let mut gse_packets = start;
    gse_packets.extend_from_slice(&middle);
    gse_packets.extend_from_slice(&end);

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&rtp_ts(MIS, &gse_packets));
    assert_eq!(deframer.take_deframed(), vec![edi]);
}

#[test]
fn truncated_fragment_labels_are_skipped() {
    // continuation and end fragments whose GSE length leaves no room for
    // the fragment id, and an end fragment cut off right after it
    let mut gse_packets = vec![0x20, 0x00]; // continuation, gse_length 0
    gse_packets.extend_from_slice(&[0x60, 0x00]); // end, gse_length 0
    gse_packets.extend_from_slice(&[0x60, 0x01, 0x07]); // end, only frag id

    // a healthy unfragmented PDU in the same data field still comes through
    let edi = b"still alive".to_vec();
    let pdu = ipv4_udp_pdu(Ipv4Addr::new(239, 20, 0, 1), 13000, &edi);
    gse_packets.extend_from_slice(&gse_single(&pdu));

    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&rtp_ts(MIS, &gse_packets));
    assert_eq!(deframer.take_deframed(), vec![edi]);
}

#[test]
fn non_rtp_datagram_is_skipped() {
    let mut deframer = GseDeframer::new(config());
    deframer.process_packet(&[0u8; 200]);
    deframer.process_packet(&[0x80, 0x21]);
    assert!(deframer.take_deframed().is_empty());
}
