//! Multi-statement batch framing.
//!
//! A batch of queries goes on the wire as a single COM_QUERY whose payload
//! is the queries joined by `;`. The payload routinely exceeds the
//! single-packet limit, so framing streams it across continuation packets:
//!
//! - the first packet carries a 5-byte header (3-byte length, sequence 0,
//!   the 0x03 command byte), which costs one byte of payload capacity;
//! - continuation packets carry the plain 4-byte header;
//! - a query may straddle a packet boundary at any byte;
//! - a separator that lands exactly on a boundary is deferred and becomes
//!   the first byte of the next packet;
//! - a final packet of exactly the maximum size is followed by an empty
//!   packet so the server knows the payload ended.
//!
//! The queue is drained destructively as bytes are written. The number of
//! bytes put on the wire (headers aside) always equals the batch's
//! precomputed payload length plus the command byte.

use std::io::{self, Write};

use tracing::trace;

use crate::protocol::{Command, MAX_PACKET_SIZE};
use crate::query::Batch;

const SEPARATOR: u8 = b';';

/// Frame a batch onto `out`, draining its queue. Returns the number of
/// packets written.
pub fn write_batch<W: Write>(batch: &mut Batch, out: &mut W) -> io::Result<usize> {
    write_batch_with_limit(batch, out, MAX_PACKET_SIZE)
}

/// Same as [`write_batch`] with an explicit packet size limit. Split out so
/// boundary behavior is testable without 16MB payloads.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_batch_with_limit<W: Write>(
    batch: &mut Batch,
    out: &mut W,
    max_packet: usize,
) -> io::Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    let total = batch.payload_len();

    // Fast path: everything, command byte included, fits in one packet.
    if total + 1 <= max_packet as u64 {
        let framed_len = (total + 1) as u32;
        out.write_all(&[
            (framed_len & 0xFF) as u8,
            ((framed_len >> 8) & 0xFF) as u8,
            ((framed_len >> 16) & 0xFF) as u8,
            0,
            Command::Query as u8,
        ])?;

        let mut first = true;
        while let Some(query) = batch.pop_front() {
            if !first {
                out.write_all(&[SEPARATOR])?;
            }
            out.write_all(query.as_bytes())?;
            first = false;
        }
        out.flush()?;
        batch.clear();
        return Ok(1);
    }

    trace!(total, "splitting batch across packets");

    let mut total_remaining = total;
    let mut packet_index: usize = 0;
    let mut pending_separator = false;
    // Offset into the front query when it straddled the previous packet
    let mut query_offset: usize = 0;
    let mut last_chunk_full = true;

    while total_remaining > 0 || last_chunk_full {
        let advertised = total_remaining.min(max_packet as u64) as usize;
        last_chunk_full = advertised == max_packet;

        let seq = (packet_index & 0xFF) as u8;
        let mut room = if packet_index == 0 {
            // First packet: the command byte takes one of the advertised bytes
            out.write_all(&[
                (advertised & 0xFF) as u8,
                ((advertised >> 8) & 0xFF) as u8,
                ((advertised >> 16) & 0xFF) as u8,
                seq,
                Command::Query as u8,
            ])?;
            advertised - 1
        } else {
            out.write_all(&[
                (advertised & 0xFF) as u8,
                ((advertised >> 8) & 0xFF) as u8,
                ((advertised >> 16) & 0xFF) as u8,
                seq,
            ])?;
            advertised
        };

        while room > 0 {
            if pending_separator {
                out.write_all(&[SEPARATOR])?;
                pending_separator = false;
                room -= 1;
                total_remaining -= 1;
                continue;
            }

            let Some(front) = batch.front() else {
                // The running total disagreed with the queue contents
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "batch payload total exceeds queued query bytes",
                ));
            };

            let left = front.len() - query_offset;
            if left <= room {
                out.write_all(&front.as_bytes()[query_offset..])?;
                room -= left;
                total_remaining -= left as u64;
                query_offset = 0;
                batch.pop_front();

                if !batch.is_empty() {
                    if room > 0 {
                        out.write_all(&[SEPARATOR])?;
                        room -= 1;
                        total_remaining -= 1;
                    } else {
                        // Separator lands exactly on the boundary; it opens
                        // the next packet instead
                        pending_separator = true;
                    }
                }
            } else {
                out.write_all(&front.as_bytes()[query_offset..query_offset + room])?;
                query_offset += room;
                total_remaining -= room as u64;
                room = 0;
            }
        }

        out.flush()?;
        packet_index += 1;
    }

    batch.clear();
    Ok(packet_index)
}
