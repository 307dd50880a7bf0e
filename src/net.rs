//! Transport egress.
//!
//! The outer connection layer owns sessions and delivery; this seam only
//! accepts one encoded packet at a time per channel. The stream is designed
//! to survive drops (clients watch sequence gaps), so a full egress queue
//! sheds the packet rather than blocking the processing unit.

pub mod adpcm;
pub mod packet;

use async_channel::{Receiver, Sender, TrySendError};
use packet::OutputPacket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Byte-sink accepting completed packets. Returns `false` once the transport
/// is gone, letting the channel wind down.
pub trait PacketSink {
    fn send(&self, packet: OutputPacket) -> bool;
}

/// Egress stream feeding the transport task, mirroring the bounded capture
/// stream used for sample intake. Dropped packets are counted, not retried.
pub struct ChannelSink {
    tx: Sender<OutputPacket>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, packet: OutputPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(pkt)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("egress full: dropped packet seq {} ({total} total)", pkt.seq);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Build a bounded packet stream: the sink goes to the pipeline, the
/// receiver to the transport task.
pub fn packet_stream(capacity: usize) -> (ChannelSink, Receiver<OutputPacket>) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    (
        ChannelSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wf::ChannelId;

    fn pkt(seq: u32) -> OutputPacket {
        OutputPacket {
            channel: ChannelId::new(0),
            seq,
            compressed: false,
            bytes: vec![0; 16],
        }
    }

    #[test]
    fn full_queue_sheds_instead_of_blocking() {
        let (sink, rx) = packet_stream(1);
        assert!(sink.send(pkt(0)));
        assert!(sink.send(pkt(1)));
        assert_eq!(sink.dropped_packets(), 1);
        assert_eq!(rx.try_recv().unwrap().seq, 0);
    }

    #[test]
    fn closed_transport_is_reported() {
        let (sink, rx) = packet_stream(4);
        drop(rx);
        assert!(!sink.send(pkt(0)));
    }
}
