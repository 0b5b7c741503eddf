//! Frame codec for the SCS/STS packet shape
//! ==========================================
//!
//! ```text
//! FF FF | ID | LEN | INST/ERR | P0 .. Pn | CHK
//!         └──────── checksum region ───┘
//! LEN = n_params + 2,  CHK = !(ID + LEN + INST + P0 + .. + Pn)
//! ```
//!
//! Everything here is pure: no I/O, no timing.

use heapless::Vec;

use super::error::{CommError, StatusError};
use super::protocol::{self as p, idx};

/// An encoded instruction frame, ready for the wire.
pub type Frame = Vec<u8, { p::TXPACKET_MAX_LEN }>;
/// Parameter bytes of a status frame.
pub type Params = Vec<u8, { p::MAX_DATA_LEN }>;

/* ------------------------------------------------------------------------- */
/*  Byte order                                                               */
/* ------------------------------------------------------------------------- */
/// Which byte of a 16-bit register is "low". STS parts are little endian,
/// the older SCS parts big endian. Header, length and checksum are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Protocol-end flag used by Feetech tools: 0 = STS, 1 = SCS.
    pub const fn from_variant(end: u8) -> Self {
        if end == 0 {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }

    /// Combine two bytes in wire order into a word.
    pub const fn make_word(self, a: u8, b: u8) -> u16 {
        match self {
            ByteOrder::LittleEndian => (a as u16) | ((b as u16) << 8),
            ByteOrder::BigEndian => (b as u16) | ((a as u16) << 8),
        }
    }

    pub const fn make_dword(self, lo: u16, hi: u16) -> u32 {
        (lo as u32) | ((hi as u32) << 16)
    }

    pub const fn lo_byte(self, w: u16) -> u8 {
        match self {
            ByteOrder::LittleEndian => w as u8,
            ByteOrder::BigEndian => (w >> 8) as u8,
        }
    }

    pub const fn hi_byte(self, w: u16) -> u8 {
        match self {
            ByteOrder::LittleEndian => (w >> 8) as u8,
            ByteOrder::BigEndian => w as u8,
        }
    }

    pub const fn lo_word(self, l: u32) -> u16 {
        l as u16
    }

    pub const fn hi_word(self, l: u32) -> u16 {
        (l >> 16) as u16
    }

    /// Word in wire order.
    pub const fn word_bytes(self, w: u16) -> [u8; 2] {
        [self.lo_byte(w), self.hi_byte(w)]
    }

    pub const fn dword_bytes(self, l: u32) -> [u8; 4] {
        let lo = self.lo_word(l);
        let hi = self.hi_word(l);
        [
            self.lo_byte(lo),
            self.hi_byte(lo),
            self.lo_byte(hi),
            self.hi_byte(hi),
        ]
    }

    /// Compose a 1/2/4-byte field starting at `data[0]`. Other widths give 0.
    pub fn compose(self, data: &[u8], width: u8) -> u32 {
        match (width, data) {
            (1, [a, ..]) => *a as u32,
            (2, [a, b, ..]) => self.make_word(*a, *b) as u32,
            (4, [a, b, c, d, ..]) => self.make_dword(self.make_word(*a, *b), self.make_word(*c, *d)),
            _ => 0,
        }
    }
}

/* ------------------------------------------------------------------------- */
/*  Instructions                                                             */
/* ------------------------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instruction {
    Ping,
    Read,
    Write,
    RegWrite,
    Action,
    SyncRead,
    SyncWrite,
    /// Reply-only marker; never encoded.
    Status,
}

impl Instruction {
    pub const fn code(self) -> Option<u8> {
        match self {
            Instruction::Ping => Some(p::INST_PING),
            Instruction::Read => Some(p::INST_READ),
            Instruction::Write => Some(p::INST_WRITE),
            Instruction::RegWrite => Some(p::INST_REG_WRITE),
            Instruction::Action => Some(p::INST_ACTION),
            Instruction::SyncRead => Some(p::INST_SYNC_READ),
            Instruction::SyncWrite => Some(p::INST_SYNC_WRITE),
            Instruction::Status => None,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            p::INST_PING => Some(Instruction::Ping),
            p::INST_READ => Some(Instruction::Read),
            p::INST_WRITE => Some(Instruction::Write),
            p::INST_REG_WRITE => Some(Instruction::RegWrite),
            p::INST_ACTION => Some(Instruction::Action),
            p::INST_SYNC_READ => Some(Instruction::SyncRead),
            p::INST_SYNC_WRITE => Some(Instruction::SyncWrite),
            _ => None,
        }
    }

    /// Sync instructions always target the broadcast id.
    pub const fn is_broadcast_only(self) -> bool {
        matches!(self, Instruction::SyncRead | Instruction::SyncWrite)
    }
}

/* ------------------------------------------------------------------------- */
/*  Encode / decode                                                          */
/* ------------------------------------------------------------------------- */
/// `!(sum of bytes)`, the checksum of every SCS frame.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |a, &b| a.wrapping_add(b))
}

/// Build `FF FF id len inst params.. chk`.
pub fn encode_instruction(id: u8, inst: Instruction, params: &[u8]) -> Result<Frame, CommError> {
    let code = inst.code().ok_or(CommError::TxError)?;
    if inst.is_broadcast_only() && id != p::BROADCAST_ID {
        return Err(CommError::TxError);
    }
    if params.len() + p::STATUS_MIN_LEN > p::TXPACKET_MAX_LEN {
        return Err(CommError::TxError);
    }

    let mut frame = Frame::new();
    frame.extend_from_slice(&p::HEADER).map_err(|_| CommError::TxError)?;
    frame
        .extend_from_slice(&[id, params.len() as u8 + 2, code])
        .map_err(|_| CommError::TxError)?;
    frame.extend_from_slice(params).map_err(|_| CommError::TxError)?;
    let chk = checksum(&frame[idx::ID..]);
    frame.push(chk).map_err(|_| CommError::TxError)?;
    Ok(frame)
}

/// A validated status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub error: StatusError,
    pub params: Params,
}

/// Parse exactly one status frame. Any violation is `RxCorrupt`; the caller
/// decides whether to resynchronize.
pub fn decode_status(bytes: &[u8]) -> Result<StatusPacket, CommError> {
    if bytes.len() < p::STATUS_MIN_LEN || bytes.len() > p::RXPACKET_MAX_LEN {
        return Err(CommError::RxCorrupt);
    }
    if bytes[..2] != p::HEADER || bytes[idx::ID] > p::MAX_STATUS_ID {
        return Err(CommError::RxCorrupt);
    }
    let len_field = bytes[idx::LENGTH] as usize;
    if len_field < 2 || len_field + 4 != bytes.len() {
        return Err(CommError::RxCorrupt);
    }
    let last = bytes.len() - 1;
    if checksum(&bytes[idx::ID..last]) != bytes[last] {
        return Err(CommError::RxCorrupt);
    }

    let mut params = Params::new();
    params
        .extend_from_slice(&bytes[idx::PARAM_0..last])
        .map_err(|_| CommError::RxCorrupt)?;
    Ok(StatusPacket {
        id: bytes[idx::ID],
        error: StatusError(bytes[idx::ERROR]),
        params,
    })
}

/// Build a status frame. Used by the mock transport and by tests to play the servo side.
pub fn encode_status(id: u8, error: u8, params: &[u8]) -> Result<Frame, CommError> {
    if params.len() + p::STATUS_MIN_LEN > p::RXPACKET_MAX_LEN {
        return Err(CommError::TxError);
    }
    let mut frame = Frame::new();
    frame.extend_from_slice(&p::HEADER).map_err(|_| CommError::TxError)?;
    frame
        .extend_from_slice(&[id, params.len() as u8 + 2, error])
        .map_err(|_| CommError::TxError)?;
    frame.extend_from_slice(params).map_err(|_| CommError::TxError)?;
    let chk = checksum(&frame[idx::ID..]);
    frame.push(chk).map_err(|_| CommError::TxError)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_instruction_matches_wire_capture() {
        let frame = encode_instruction(1, Instruction::Read, &[56, 2]).unwrap();
        assert_eq!(frame.as_slice(), &[0xFF, 0xFF, 0x01, 0x04, 0x02, 0x38, 0x02, 0xBE]);
    }

    #[test]
    fn status_reply_decodes_to_position() {
        let reply = [0xFF, 0xFF, 0x01, 0x04, 0x00, 0xE8, 0x03, 0x0F];
        let status = decode_status(&reply).unwrap();
        assert_eq!(status.id, 1);
        assert!(status.error.is_ok());
        assert_eq!(ByteOrder::LittleEndian.compose(&status.params, 2), 1000);
        assert_eq!(ByteOrder::BigEndian.compose(&status.params, 2), 0xE803);
    }

    #[test]
    fn checksum_round_trip_recovers_fields() {
        let params = [0x2A, 0x00, 0x10, 0xFF];
        let frame = encode_instruction(7, Instruction::Write, &params).unwrap();
        // an instruction frame has the same shape as a status frame
        let back = decode_status(&frame).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.error.bits(), p::INST_WRITE);
        assert_eq!(back.params.as_slice(), &params);
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let frame = encode_status(3, 0, &[0x10, 0x20, 0x30]).unwrap();
        for byte in idx::PARAM_0..frame.len() {
            for bit in 0..8 {
                let mut bad = frame.clone();
                bad[byte] ^= 1 << bit;
                assert_eq!(decode_status(&bad), Err(CommError::RxCorrupt), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn oversized_frames_are_refused() {
        let params = [0u8; p::TXPACKET_MAX_LEN - p::STATUS_MIN_LEN];
        assert!(encode_instruction(1, Instruction::Write, &params).is_ok());
        let params = [0u8; p::TXPACKET_MAX_LEN - p::STATUS_MIN_LEN + 1];
        assert_eq!(
            encode_instruction(1, Instruction::Write, &params),
            Err(CommError::TxError)
        );
        assert_eq!(
            encode_instruction(1, Instruction::Status, &[]),
            Err(CommError::TxError)
        );
    }

    #[test]
    fn decode_rejects_reserved_ids_and_bad_lengths() {
        let mut frame = encode_status(0xFD, 0, &[]).unwrap();
        assert!(decode_status(&frame).is_ok());
        frame[idx::ID] = 0xFE;
        assert_eq!(decode_status(&frame), Err(CommError::RxCorrupt));

        let frame = encode_status(1, 0, &[1, 2]).unwrap();
        assert_eq!(decode_status(&frame[..frame.len() - 1]), Err(CommError::RxCorrupt));
    }

    #[test]
    fn sync_instructions_only_go_to_broadcast() {
        assert_eq!(
            encode_instruction(1, Instruction::SyncWrite, &[42, 2]),
            Err(CommError::TxError)
        );
        assert!(encode_instruction(p::BROADCAST_ID, Instruction::SyncRead, &[56, 2, 1]).is_ok());
        assert_eq!(Instruction::from_code(p::INST_SYNC_READ), Some(Instruction::SyncRead));
        assert_eq!(Instruction::from_code(0x55), None);
    }

    #[test]
    fn dword_composition_follows_byte_order() {
        let le = ByteOrder::LittleEndian;
        assert_eq!(le.compose(&[0x78, 0x56, 0x34, 0x12], 4), 0x1234_5678);
        assert_eq!(le.dword_bytes(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
        let be = ByteOrder::BigEndian;
        assert_eq!(be.compose(&[0x56, 0x78, 0x12, 0x34], 4), 0x1234_5678);
        assert_eq!(be.word_bytes(0x03E8), [0x03, 0xE8]);
        assert_eq!(le.compose(&[1, 2, 3], 3), 0);
        assert_eq!(ByteOrder::from_variant(0), le);
        assert_eq!(ByteOrder::from_variant(1), be);
    }
}
