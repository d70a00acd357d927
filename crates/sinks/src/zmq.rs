//! Legacy ETI-over-ZMQ output
//!
//! Reconstructured ETI frames are published in groups of four so the
//! receiver never breaks ETI versus transmission-frame phase: emission
//! only starts at frame phase 0, and a phase jump inside a group is a
//! hard error. One message is
//!
//! ```text
//! u32 version = 1 | i16 buflen[4] | frame0 .. frame3   (little endian)
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeromq::{Socket, SocketSend, ZmqMessage};

use edibridge_protocol::eti::EtiFrame;

use crate::error::SinkError;

/// ETI frames per ZMQ message.
pub const FRAMES_PER_MESSAGE: usize = 4;

/// Serialise one group of four frames.
pub fn encode_zmq_message(frames: &[EtiFrame]) -> Vec<u8> {
    debug_assert_eq!(frames.len(), FRAMES_PER_MESSAGE);
    let total: usize = frames.iter().map(|f| f.frame.len()).sum();
    let mut out = Vec::with_capacity(4 + 2 * FRAMES_PER_MESSAGE + total);
    out.extend_from_slice(&1u32.to_le_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.frame.len() as i16).to_le_bytes());
    }
    for frame in frames {
        out.extend_from_slice(&frame.frame);
    }
    out
}

/// Collects frames into phase-aligned groups of four.
#[derive(Debug, Default)]
pub struct PhaseGrouper {
    expected_next_fp: u8,
    group: Vec<EtiFrame>,
}

impl PhaseGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one frame; yields a full group every fourth aligned frame.
    /// Frames ahead of the first phase-0 frame are discarded; a phase
    /// jump inside a group is an error.
    pub fn push(&mut self, frame: EtiFrame) -> Result<Option<Vec<EtiFrame>>, SinkError> {
        let fp = frame.fc.fp % 4;
        if fp == self.expected_next_fp {
            self.expected_next_fp = (self.expected_next_fp + 1) % 4;
            self.group.push(frame);
            if self.group.len() == FRAMES_PER_MESSAGE {
                return Ok(Some(std::mem::take(&mut self.group)));
            }
            Ok(None)
        } else if self.expected_next_fp != 0 {
            Err(SinkError::FramePhase {
                expected: self.expected_next_fp,
                got: fp,
            })
        } else {
            // still waiting for the stream to reach phase 0
            Ok(None)
        }
    }
}

/// ZMQ PUB output task. A frame-phase error is fatal and propagates.
pub struct ZmqEtiOutput {
    endpoint: String,
}

impl ZmqEtiOutput {
    /// `endpoint` as given on the command line, e.g. `*:8001`.
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn bind_address(&self) -> String {
        format!("tcp://{}", self.endpoint.replacen('*', "0.0.0.0", 1))
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<EtiFrame>,
        cancel: CancellationToken,
    ) -> Result<(), SinkError> {
        let mut socket = zeromq::PubSocket::new();
        let address = self.bind_address();
        socket
            .bind(&address)
            .await
            .map_err(|e| SinkError::Zmq(e.to_string()))?;
        tracing::info!(endpoint = %address, "ZMQ ETI output listening");

        let mut grouper = PhaseGrouper::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Some(group) = grouper.push(frame)? {
                            let message = Bytes::from(encode_zmq_message(&group));
                            if let Err(e) = socket.send(ZmqMessage::from(message)).await {
                                tracing::warn!(error = %e, "ZMQ send failed");
                            }
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edibridge_protocol::tag::FcData;
    use edibridge_protocol::FrameTimestamp;

    fn eti(fp: u8, len: usize) -> EtiFrame {
        EtiFrame {
            frame: vec![fp; len],
            timestamp: FrameTimestamp::new(100, 0),
            fc: FcData {
                fp,
                ..Default::default()
            },
        }
    }

    #[test]
    fn groups_start_at_phase_zero() {
        let mut grouper = PhaseGrouper::new();
        // mid-cycle frames before alignment are discarded
        assert!(grouper.push(eti(2, 10)).unwrap().is_none());
        assert!(grouper.push(eti(3, 10)).unwrap().is_none());

        assert!(grouper.push(eti(0, 10)).unwrap().is_none());
        assert!(grouper.push(eti(1, 10)).unwrap().is_none());
        assert!(grouper.push(eti(2, 10)).unwrap().is_none());
        let group = grouper.push(eti(3, 10)).unwrap().unwrap();
        assert_eq!(group.len(), 4);
        assert_eq!(group[0].fc.fp, 0);
        assert_eq!(group[3].fc.fp, 3);
    }

    #[test]
    fn consecutive_groups_flow() {
        let mut grouper = PhaseGrouper::new();
        for round in 0..3 {
            for fp in 0..4u8 {
                let result = grouper.push(eti(fp, 10)).unwrap();
                assert_eq!(result.is_some(), fp == 3, "round {round} fp {fp}");
            }
        }
    }

    #[test]
    fn phase_jump_inside_group_is_fatal() {
        let mut grouper = PhaseGrouper::new();
        grouper.push(eti(0, 10)).unwrap();
        grouper.push(eti(1, 10)).unwrap();
        let err = grouper.push(eti(3, 10)).unwrap_err();
        assert!(matches!(
            err,
            SinkError::FramePhase {
                expected: 2,
                got: 3
            }
        ));
    }

    #[test]
    fn message_head_and_payload() {
        let frames = vec![eti(0, 100), eti(1, 200), eti(2, 150), eti(3, 50)];
        let message = encode_zmq_message(&frames);

        assert_eq!(&message[0..4], &1u32.to_le_bytes());
        assert_eq!(i16::from_le_bytes([message[4], message[5]]), 100);
        assert_eq!(i16::from_le_bytes([message[6], message[7]]), 200);
        assert_eq!(i16::from_le_bytes([message[8], message[9]]), 150);
        assert_eq!(i16::from_le_bytes([message[10], message[11]]), 50);
        assert_eq!(message.len(), 12 + 500);
        // first frame starts right after the head
        assert_eq!(message[12], 0);
        assert_eq!(message[12 + 100], 1);
    }

    #[test]
    fn eight_times_fp_wraps_modulo_four() {
        // frame phase is a 3-bit field; 4..7 map onto 0..3
        let mut grouper = PhaseGrouper::new();
        grouper.push(eti(4, 10)).unwrap();
        grouper.push(eti(5, 10)).unwrap();
        grouper.push(eti(6, 10)).unwrap();
        assert!(grouper.push(eti(7, 10)).unwrap().is_some());
    }
}
