// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Packet data model (§3). A packet is immutable once published: the
//! payload is a reference-counted [`bytes::Bytes`] so every consumer can
//! hold a cheap handle into the ring without copying.

use bytes::Bytes;

/// Per-packet flags (§3), packed into a byte the way the teacher packs its
/// on-disk record headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// This packet starts (or is) a key frame.
    pub const KEY_FRAME: PacketFlags = PacketFlags(0b0000_0001);
    /// A discontinuity precedes this packet (ring lag, reconnect, rotation).
    pub const DISCONTINUITY: PacketFlags = PacketFlags(0b0000_0010);
    pub const NONE: PacketFlags = PacketFlags(0);

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// Container-level codec identifier. The core never decodes pixels; this
/// is only used to pick MP4 sample entry parameters and HLS codec strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Aac,
    Unknown,
}

/// An immutable, reference-counted packet published into the ring (§3).
///
/// Invariant: within a stream, `seq` strictly increases; `pts_us`/`dts_us`
/// are weakly monotonic modulo [`PacketFlags::DISCONTINUITY`].
#[derive(Debug, Clone)]
pub struct Packet {
    pub seq: u64,
    pub pts_us: i64,
    pub dts_us: i64,
    pub flags: PacketFlags,
    pub codec: Codec,
    pub payload: Bytes,
}

impl Packet {
    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(PacketFlags::KEY_FRAME)
    }

    pub fn is_discontinuity(&self) -> bool {
        self.flags.contains(PacketFlags::DISCONTINUITY)
    }
}
