// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shared fragmented-MP4 (ISO-BMFF) box writing, used by both the
//! Segmenter (long-form `.mp4` recordings) and the HLS Writer (short-form
//! `.m4s` fMP4 segments for LL-HLS). Generalized from the teacher's fixed
//! LE record-header writer (`storage::chunk_pool`) into a generic
//! `[u32 size][4-byte type][body]` box writer.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

/// Write one box, computing its size after the body closure runs into an
/// intermediate buffer. Returns the total bytes written (header + body).
pub fn write_box<W, F>(w: &mut W, box_type: &[u8; 4], body: F) -> io::Result<u64>
where
    W: Write,
    F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
{
    let mut buf = Vec::new();
    body(&mut buf)?;
    let size = (buf.len() + 8) as u32;
    w.write_u32::<BigEndian>(size)?;
    w.write_all(box_type)?;
    w.write_all(&buf)?;
    Ok(size as u64)
}

/// `ftyp` + `moov`/`mvex`/`trex`: the fragmented-MP4 header every segment
/// (long-form or HLS) starts with. `timescale` is in units-per-second;
/// every timestamp in this crate is microseconds, so callers pass
/// `1_000_000`.
pub fn write_init_segment<W: Write>(w: &mut W, track_id: u32, timescale: u32) -> io::Result<u64> {
    let ftyp = write_box(w, b"ftyp", |w| {
        w.write_all(b"isom")?;
        w.write_u32::<BigEndian>(512)?;
        w.write_all(b"isomiso5dash")?;
        Ok(())
    })?;
    let moov = write_box(w, b"moov", |w| {
        write_box(w, b"mvhd", |w| {
            w.write_u32::<BigEndian>(0)?; // version/flags
            w.write_u32::<BigEndian>(0)?; // creation_time
            w.write_u32::<BigEndian>(0)?; // modification_time
            w.write_u32::<BigEndian>(timescale)?;
            w.write_u32::<BigEndian>(0)?; // duration (unknown, fragmented)
            Ok(())
        })?;
        write_box(w, b"mvex", |w| {
            write_box(w, b"trex", |w| {
                w.write_u32::<BigEndian>(track_id)?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    })?;
    Ok(ftyp + moov)
}

/// `moof`(`mfhd`+`traf`(`tfhd`+`tfdt`)) + `mdat`: one fragment carrying a
/// single access unit. Returns the total bytes written.
pub fn write_fragment<W: Write>(
    w: &mut W,
    track_id: u32,
    sequence_number: u32,
    pts_us: i64,
    payload: &[u8],
) -> io::Result<u64> {
    let moof = write_box(w, b"moof", |w| {
        write_box(w, b"mfhd", |w| {
            w.write_u32::<BigEndian>(sequence_number)?;
            Ok(())
        })?;
        write_box(w, b"traf", |w| {
            write_box(w, b"tfhd", |w| {
                w.write_u32::<BigEndian>(track_id)?;
                Ok(())
            })?;
            write_box(w, b"tfdt", |w| {
                w.write_i64::<BigEndian>(pts_us)?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    })?;
    let mdat = write_box(w, b"mdat", |w| w.write_all(payload))?;
    Ok(moof + mdat)
}
