//! The resequencing RTP receiver (C1). Blocking on `T1`, as required by
//! spec §5 — it must never suspend on anything but the socket read.

use super::header::{parse_header, seq_diff, RtpHeader};
use crate::error::RtpError;
use crate::types::{ChannelInfo, SampleBatch};
use num_complex::Complex32;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

/// Network seam, mockable in tests the way the teacher mocks `PtpNetwork`.
#[cfg_attr(test, mockall::automock)]
pub trait RtpNetwork: Send {
    fn recv_packet(&mut self) -> Result<Option<(Vec<u8>, SystemTime)>, RtpError>;
}

/// Upstream channel listing adapter. The discovery protocol itself is
/// unspecified (spec §6.2); implementations provide their own adapter.
#[cfg_attr(test, mockall::automock)]
pub trait ChannelDiscovery: Send {
    fn discover(&mut self) -> anyhow::Result<Vec<ChannelInfo>>;
}

pub struct RtpSocketImpl {
    socket: Socket,
}

impl RtpSocketImpl {
    pub fn bind(multicast: Ipv4Addr, port: u16, interface: Ipv4Addr) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&multicast, &interface)?;
        socket.set_multicast_loop_v4(false)?;
        Ok(Self { socket })
    }
}

impl RtpNetwork for RtpSocketImpl {
    fn recv_packet(&mut self) -> Result<Option<(Vec<u8>, SystemTime)>, RtpError> {
        let mut buf = [std::mem::MaybeUninit::uninit(); 65536];
        let (n, _addr) = self.socket.recv_from(&mut buf)?;
        let bytes: Vec<u8> = buf[..n]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();
        Ok(Some((bytes, SystemTime::now())))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_resequenced: u64,
    pub late_dropped: u64,
    pub total_gap_samples: u64,
    pub last_rtp_timestamp: u32,
}

/// Resequences out-of-order RTP packets and surfaces gap-annotated
/// `SampleBatch`es (spec §4.1).
pub struct RtpReceiver<N: RtpNetwork> {
    network: N,
    depth: usize,
    buffer: BTreeMap<i64, (RtpHeader, Vec<Complex32>)>,
    next_expected_ext: Option<i64>,
    base_seq: u16,
    nominal_samples_per_packet: u32,
    pub stats: ReceiverStats,
}

impl<N: RtpNetwork> RtpReceiver<N> {
    pub fn new(network: N, depth: usize) -> Self {
        Self {
            network,
            depth,
            buffer: BTreeMap::new(),
            next_expected_ext: None,
            base_seq: 0,
            nominal_samples_per_packet: 400,
            stats: ReceiverStats::default(),
        }
    }

    fn extend_sequence(&self, sequence: u16) -> i64 {
        self.base_seq as i64 + seq_diff(sequence, self.base_seq) as i64
    }

    /// Reads packets until either a deliverable batch is produced, or the
    /// underlying socket signals end-of-stream (`Ok(None)`).
    pub fn recv_batch(&mut self) -> Result<Option<SampleBatch>, RtpError> {
        loop {
            if let Some(batch) = self.try_deliver()? {
                return Ok(Some(batch));
            }
            let Some((datagram, arrival)) = self.network.recv_packet()? else {
                return Ok(None);
            };
            let (header, samples) = parse_header(&datagram)?;
            self.stats.packets_received += 1;
            self.nominal_samples_per_packet = samples.len().max(1) as u32;

            if self.next_expected_ext.is_none() {
                self.base_seq = header.sequence;
                self.next_expected_ext = Some(self.extend_sequence(header.sequence));
            }
            let ext_seq = self.extend_sequence(header.sequence);
            let next_expected = self.next_expected_ext.unwrap();
            if ext_seq < next_expected - self.depth as i64 {
                self.stats.late_dropped += 1;
                continue;
            }
            if ext_seq < next_expected {
                self.stats.packets_resequenced += 1;
            }
            let arrival_wall_time = arrival
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            self.buffer.insert(ext_seq, (header, samples));
            let _ = arrival_wall_time;

            if let Some(batch) = self.try_deliver()? {
                return Ok(Some(batch));
            }
        }
    }

    fn try_deliver(&mut self) -> Result<Option<SampleBatch>, RtpError> {
        let Some(next_expected) = self.next_expected_ext else {
            return Ok(None);
        };

        if let Some((header, samples)) = self.buffer.remove(&next_expected) {
            self.next_expected_ext = Some(next_expected + 1);
            self.stats.last_rtp_timestamp = header.timestamp;
            return Ok(Some(SampleBatch {
                rtp_timestamp: header.timestamp,
                rtp_sequence: header.sequence,
                samples,
                gap_samples_before: 0,
                arrival_wall_time: now_secs(),
            }));
        }

        // Confirmed gap: the resequence window has closed on an entry
        // that arrived without `next_expected` ever showing up.
        if self.buffer.len() >= self.depth {
            if let Some((&oldest_key, _)) = self.buffer.iter().next() {
                let missing = (oldest_key - next_expected).max(0) as u64;
                let (header, samples) = self.buffer.remove(&oldest_key).unwrap();
                self.stats.packets_lost += missing;
                let gap_samples = missing * self.nominal_samples_per_packet as u64;
                self.stats.total_gap_samples += gap_samples;
                self.next_expected_ext = Some(oldest_key + 1);
                self.stats.last_rtp_timestamp = header.timestamp;
                return Ok(Some(SampleBatch {
                    rtp_timestamp: header.timestamp,
                    rtp_sequence: header.sequence,
                    samples,
                    gap_samples_before: gap_samples as u32,
                    arrival_wall_time: now_secs(),
                }));
            }
        }
        Ok(None)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
