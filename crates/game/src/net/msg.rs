//! Reliable-in-order message frames over unreliable packets.
//!
//! Each tick, queued messages are consolidated into one frame stamped with
//! the local sequence id. Outbound frames are kept in a ring and re-emitted
//! until the peer acks them; inbound frames land in a ring under their
//! carried sequence id and are applied by advancing a cursor one sequence at
//! a time, never skipping.

use super::bitstream::{BitReader, BitWriter, StreamResult};
use super::sequence::{
    sequence_advance, sequence_more_recent, sequence_relative_to, Ack, SequenceHistory, SequenceId,
    NET_SEQUENCE_INVALID,
};
use super::{
    NET_ACK_PREVIOUS_SEQUENCES, NET_HISTORY_SIZE, NET_MAX_MESSAGES_SIZE,
    NET_PREVIOUS_SEQUENCES_SEARCH, NET_SEQUENCE_COUNT, NET_TICK_RATE, NET_TIMEOUT,
};

/// One tick's worth of messages. Outbound frames carry the `encoded` form
/// (length + sequence id + payload) ready to blit into a packet; inbound
/// frames carry only the payload.
#[derive(Debug, Clone, Default)]
pub struct MessageFrame {
    pub sequence_id: SequenceId,
    pub timestamp: f32,
    pub bytes: usize,
    pub encoded: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Fixed-capacity ring of message frames, newest at `current_index`.
#[derive(Debug, Default)]
pub struct MessageHistory {
    frames: Vec<MessageFrame>,
    current_index: usize,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> Option<&MessageFrame> {
        self.frames.get(self.current_index)
    }

    pub fn add(&mut self, timestamp: f32, bytes: usize) -> &mut MessageFrame {
        if self.frames.len() < NET_HISTORY_SIZE {
            self.frames.push(MessageFrame::default());
            self.current_index = self.frames.len() - 1;
        } else {
            self.current_index = (self.current_index + 1) % self.frames.len();
        }
        let frame = &mut self.frames[self.current_index];
        *frame = MessageFrame {
            timestamp,
            bytes,
            ..MessageFrame::default()
        };
        frame
    }

    /// Walk frames newest-to-oldest, bounded by the search depth and the
    /// timeout window.
    fn iter_recent(&self, now: f32) -> impl Iterator<Item = &MessageFrame> {
        let mut index = self.current_index;
        let mut emitted = 0usize;
        let mut done = self.frames.is_empty();
        std::iter::from_fn(move || {
            if done || emitted >= NET_PREVIOUS_SEQUENCES_SEARCH {
                return None;
            }
            let frame = &self.frames[index];
            emitted += 1;
            let next = if index > 0 {
                index - 1
            } else {
                self.frames.len() - 1
            };
            if next == self.current_index || self.frames[next].timestamp < now - NET_TIMEOUT {
                done = true;
            }
            index = next;
            Some(frame)
        })
    }

    /// Most recent sequence id observed, or `NET_SEQUENCE_INVALID`.
    pub fn most_recent_sequence(&self, now: f32) -> SequenceId {
        let mut result = NET_SEQUENCE_INVALID;
        for frame in self.iter_recent(now) {
            if result == NET_SEQUENCE_INVALID || sequence_more_recent(frame.sequence_id, result) {
                result = frame.sequence_id;
            }
        }
        result
    }

    /// Derive the ack to send to the peer from what sits in this ring.
    pub fn ack(&self, now: f32) -> Ack {
        let mut ack = Ack::default();
        if self.frames.is_empty() {
            return ack;
        }
        ack.sequence_id = self.most_recent_sequence(now);
        for frame in self.iter_recent(now) {
            if frame.sequence_id == ack.sequence_id {
                continue;
            }
            let relative = sequence_relative_to(frame.sequence_id, ack.sequence_id);
            debug_assert!(relative < 0);
            if relative >= -NET_ACK_PREVIOUS_SEQUENCES {
                ack.previous_sequences |= 1u64 << (-relative - 1);
            }
        }
        ack
    }

    pub fn frame_by_sequence(&self, sequence_id: SequenceId, now: f32) -> Option<&MessageFrame> {
        self.iter_recent(now)
            .find(|frame| frame.sequence_id == sequence_id)
    }

    /// Advance the processed-sequence cursor by at most one. Returns the next
    /// frame's sequence id and payload when it is time to apply it.
    ///
    /// The cursor only moves when the next frame is present AND either the
    /// current frame has aged a full tick relative to `timestamp` or the next
    /// frame itself is due; that throttles application to one frame per tick
    /// of wall clock.
    pub fn advance(
        &self,
        cursor: &mut SequenceId,
        timestamp: f32,
        now: f32,
    ) -> Option<(SequenceId, Vec<u8>)> {
        let current = if *cursor == NET_SEQUENCE_INVALID {
            None
        } else {
            self.frame_by_sequence(*cursor, now)
        };
        if current.is_none() && *cursor != NET_SEQUENCE_INVALID {
            return None;
        }
        let next_sequence = if *cursor == NET_SEQUENCE_INVALID {
            0
        } else {
            sequence_advance(*cursor, 1)
        };
        let next = self.frame_by_sequence(next_sequence, now)?;
        let current_aged = match current {
            None => true,
            Some(frame) => frame.timestamp <= timestamp - NET_TICK_RATE,
        };
        if current_aged || next.timestamp <= timestamp {
            *cursor = next_sequence;
            Some((next_sequence, next.payload.clone()))
        } else {
            None
        }
    }
}

/// Pack queued messages into this tick's outbound frame. Messages that do
/// not fit stay queued. The caller guarantees the queue is non-empty (a Noop
/// is injected upstream when it would be).
pub fn msgs_out_consolidate(
    queue: &mut Vec<Vec<u8>>,
    history: &mut MessageHistory,
    local_sequence_id: SequenceId,
    timestamp: f32,
) {
    let mut bytes = 0usize;
    let mut taken = 0usize;
    for msg in queue.iter() {
        if 64 + bytes + msg.len() > NET_MAX_MESSAGES_SIZE {
            break;
        }
        bytes += msg.len();
        taken += 1;
    }

    let mut payload = Vec::with_capacity(bytes);
    for msg in queue.iter().take(taken) {
        payload.extend_from_slice(msg);
    }

    let mut w = BitWriter::new();
    w.int(bytes as i64, 0, NET_MAX_MESSAGES_SIZE as i64);
    if bytes > 0 {
        w.int(local_sequence_id as i64, 0, NET_SEQUENCE_COUNT as i64 - 1);
        w.bytes(&payload);
    }

    let frame = history.add(timestamp, bytes);
    frame.sequence_id = local_sequence_id;
    frame.encoded = w.finish();
    frame.payload = payload;

    queue.drain(..taken);
}

/// Emit unacked frames within the resend window, then the current frame,
/// then the zero-length end-of-messages sentinel.
pub fn msgs_write(
    p: &mut BitWriter,
    history: &MessageHistory,
    remote_ack: &Ack,
    recently_resent: &mut SequenceHistory,
    rtt: f32,
    now: f32,
) {
    let mut bytes = 0usize;

    if !history.is_empty() {
        // rewind to the oldest frame inside the search window
        let mut index = history.current_index;
        for _ in 0..NET_PREVIOUS_SEQUENCES_SEARCH {
            let next = if index > 0 {
                index - 1
            } else {
                history.frames.len() - 1
            };
            if next == history.current_index
                || history.frames[next].timestamp < now - NET_TIMEOUT
            {
                break;
            }
            index = next;
        }

        // resend oldest-to-newest, waiting out min(0.35, 2 rtt) between
        // attempts at the same sequence
        let timestamp_cutoff = now - (rtt * 2.0).min(0.35);
        for _ in 0..NET_PREVIOUS_SEQUENCES_SEARCH {
            let frame = &history.frames[index];
            let relative = sequence_relative_to(frame.sequence_id, remote_ack.sequence_id);
            if relative < 0
                && relative >= -NET_ACK_PREVIOUS_SEQUENCES
                && !remote_ack.get(frame.sequence_id)
                && !recently_resent.contains_newer_than(frame.sequence_id, timestamp_cutoff)
                && 32 + bytes + frame.encoded.len() <= NET_MAX_MESSAGES_SIZE
            {
                log::debug!(
                    "resending seq {}: {} bytes",
                    frame.sequence_id,
                    frame.bytes
                );
                bytes += frame.encoded.len();
                p.bytes(&frame.encoded);
                recently_resent.add(frame.sequence_id, now);
            }

            index = if index < history.frames.len() - 1 {
                index + 1
            } else {
                0
            };
            if index == history.current_index {
                break;
            }
        }

        // current frame
        let frame = &history.frames[history.current_index];
        if 32 + bytes + frame.encoded.len() <= NET_MAX_MESSAGES_SIZE {
            p.bytes(&frame.encoded);
        }
    }

    // zero-length frame marks the end of the message stream
    p.align();
    p.int(0, 0, NET_MAX_MESSAGES_SIZE as i64);
}

/// Consume the peer's ack, then every message frame up to the end sentinel.
/// Returns the most recent sequence id carried in this packet.
pub fn msgs_read(
    p: &mut BitReader,
    history: &mut MessageHistory,
    ack: &mut Ack,
    now: f32,
) -> StreamResult<SequenceId> {
    let mut candidate = Ack {
        // the range includes the invalid sentinel for before-first-frame acks
        sequence_id: p.int(0, NET_SEQUENCE_COUNT as i64)? as SequenceId,
        previous_sequences: p.u64()?,
    };
    if candidate.sequence_id != NET_SEQUENCE_INVALID
        && (ack.sequence_id == NET_SEQUENCE_INVALID
            || sequence_more_recent(candidate.sequence_id, ack.sequence_id))
    {
        std::mem::swap(ack, &mut candidate);
    }

    let mut received_sequence = NET_SEQUENCE_INVALID;
    let mut first_frame = true;
    loop {
        p.align()?;
        let bytes = p.int(0, NET_MAX_MESSAGES_SIZE as i64)? as usize;
        if bytes == 0 {
            break;
        }
        let sequence_id = p.int(0, NET_SEQUENCE_COUNT as i64 - 1)? as SequenceId;
        let mut payload = vec![0u8; bytes];
        p.bytes(&mut payload)?;
        p.align()?;

        if first_frame
            || received_sequence == NET_SEQUENCE_INVALID
            || sequence_more_recent(sequence_id, received_sequence)
        {
            received_sequence = sequence_id;
        }
        first_frame = false;

        let frame = history.add(now, bytes);
        frame.sequence_id = sequence_id;
        frame.payload = payload;
    }

    Ok(received_sequence)
}

/// Smooth the RTT estimate from an ack: the sample is the age of the
/// acknowledged frame in our send history, blended 95/5.
pub fn calculate_rtt(timestamp: f32, ack: &Ack, send_history: &MessageHistory, rtt: &mut f32) {
    let sample = send_history
        .frame_by_sequence(ack.sequence_id, timestamp)
        .map(|frame| timestamp - frame.timestamp);
    match sample {
        None => {}
        Some(new_rtt) => {
            if *rtt < 0.0 {
                *rtt = new_rtt;
            } else {
                *rtt = *rtt * 0.95 + new_rtt * 0.05;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(history: &mut MessageHistory, sequence_id: SequenceId, timestamp: f32) {
        let frame = history.add(timestamp, 1);
        frame.sequence_id = sequence_id;
        frame.payload = vec![0];
    }

    #[test]
    fn test_ack_from_contiguous_frames() {
        let mut history = MessageHistory::new();
        for seq in 0..8u16 {
            frame_with(&mut history, seq, seq as f32 * NET_TICK_RATE);
        }
        let ack = history.ack(8.0 * NET_TICK_RATE);
        assert_eq!(ack.sequence_id, 7);
        assert_eq!(ack.previous_sequences & 0x7f, 0x7f);
    }

    #[test]
    fn test_ack_with_gap() {
        let mut history = MessageHistory::new();
        for seq in 0..=10u16 {
            if seq == 5 {
                continue;
            }
            frame_with(&mut history, seq, seq as f32 * NET_TICK_RATE);
        }
        let ack = history.ack(11.0 * NET_TICK_RATE);
        assert_eq!(ack.sequence_id, 10);
        // bit k covers sequence 10 - (k + 1); sequence 5 is bit 4
        assert_eq!(ack.previous_sequences & (1 << 4), 0);
        for bit in [0u32, 1, 2, 3, 5, 6, 7, 8, 9] {
            assert_ne!(ack.previous_sequences & (1u64 << bit), 0, "bit {bit}");
        }
    }

    #[test]
    fn test_consolidate_packs_and_leaves_overflow() {
        let mut queue = vec![vec![1u8; 400], vec![2u8; 400], vec![3u8; 400]];
        let mut history = MessageHistory::new();
        msgs_out_consolidate(&mut queue, &mut history, 9, 0.0);

        // third message did not fit under NET_MAX_MESSAGES_SIZE
        assert_eq!(queue.len(), 1);
        let frame = history.current().unwrap();
        assert_eq!(frame.sequence_id, 9);
        assert_eq!(frame.bytes, 800);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut queue = vec![vec![0xaa; 16]];
        let mut out_history = MessageHistory::new();
        msgs_out_consolidate(&mut queue, &mut out_history, 3, 0.0);

        // packets carry the sender's ack ahead of the frame stream
        let mut w = BitWriter::new();
        w.int(3, 0, NET_SEQUENCE_COUNT as i64);
        w.u64(0);
        let mut resent = SequenceHistory::new(16);
        msgs_write(&mut w, &out_history, &Ack::default(), &mut resent, 0.1, 0.0);

        let mut in_history = MessageHistory::new();
        let mut ack = Ack::default();
        let mut reader = BitReader::new(w.finish());
        let received = msgs_read(&mut reader, &mut in_history, &mut ack, 0.0).unwrap();
        assert_eq!(received, 3);
        assert_eq!(ack.sequence_id, 3);
        let frame = in_history.frame_by_sequence(3, 0.0).unwrap();
        assert_eq!(frame.payload, vec![0xaa; 16]);
    }

    #[test]
    fn test_advance_never_skips() {
        let mut history = MessageHistory::new();
        frame_with(&mut history, 0, 0.0);
        frame_with(&mut history, 2, 0.1); // sequence 1 missing

        let mut cursor = NET_SEQUENCE_INVALID;
        let now = 10.0;
        assert!(history.advance(&mut cursor, now, now).is_some());
        assert_eq!(cursor, 0);
        // cannot advance past the hole even though 2 is buffered
        assert!(history.advance(&mut cursor, now, now).is_none());
        assert_eq!(cursor, 0);

        frame_with(&mut history, 1, 0.2);
        assert!(history.advance(&mut cursor, now, now).is_some());
        assert_eq!(cursor, 1);
        assert!(history.advance(&mut cursor, now, now).is_some());
        assert_eq!(cursor, 2);
    }

    #[test]
    fn test_resend_respects_ack_and_cutoff() {
        let mut out_history = MessageHistory::new();
        for seq in 0..4u16 {
            let mut queue = vec![vec![seq as u8; 8]];
            msgs_out_consolidate(&mut queue, &mut out_history, seq, seq as f32 * NET_TICK_RATE);
        }

        // peer acked 3 and 2, but not 0 or 1
        let remote_ack = Ack {
            sequence_id: 3,
            previous_sequences: 0b001,
        };
        let mut resent = SequenceHistory::new(16);
        let mut w = BitWriter::new();
        let now = 1.0;
        msgs_write(&mut w, &out_history, &remote_ack, &mut resent, 0.05, now);

        // both unacked old frames got queued for resend
        assert!(resent.contains_newer_than(0, 0.0));
        assert!(resent.contains_newer_than(1, 0.0));
        assert!(!resent.contains_newer_than(2, 0.0));

        // an immediate rebuild resends nothing new (cutoff holds them back)
        let mut w2 = BitWriter::new();
        let before = w.bits_written();
        msgs_write(&mut w2, &out_history, &remote_ack, &mut resent, 0.05, now);
        assert!(w2.bits_written() < before);
    }

    #[test]
    fn test_rtt_ewma() {
        let mut history = MessageHistory::new();
        frame_with(&mut history, 4, 1.0);
        let ack = Ack {
            sequence_id: 4,
            previous_sequences: 0,
        };
        let mut rtt = -1.0;
        calculate_rtt(1.25, &ack, &history, &mut rtt);
        assert!((rtt - 0.25).abs() < 1e-6);

        frame_with(&mut history, 5, 1.5);
        let ack = Ack {
            sequence_id: 5,
            previous_sequences: 0,
        };
        calculate_rtt(1.6, &ack, &history, &mut rtt);
        assert!((rtt - (0.25 * 0.95 + 0.1 * 0.05)).abs() < 1e-5);
    }
}
