//! Feetech STS‑series servo driver
//! ===========================================================
//!
//! Named operations on top of the packet transactor. Every call is one
//! transaction (or a short fixed sequence of them) and returns a
//! [`ServoError`] naming the servo and the operation on failure.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::{FnvIndexMap, Vec};

use super::bus::ServoBus;
use super::error::{CommError, ErrorKind, ServoError, StatusError};
use super::group_read::GroupSyncRead;
use super::group_write::GroupSyncWrite;
use super::protocol as p;
use super::transport::Transport;
use crate::config::{LinkConfig, MAX_SERVOS};

/// Insertion-ordered id → value map used by every batch operation.
pub type ServoMap<V> = FnvIndexMap<u8, V, MAX_SERVOS>;
pub type ServoIds = Vec<u8, MAX_SERVOS>;

/// Register width of a single read/write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Width {
    Byte = 1,
    Word = 2,
    DWord = 4,
}

/// Operating mode register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServoMode {
    Position,
    /// Continuous rotation ("wheel") mode.
    Wheel,
    Other(u8),
}

impl ServoMode {
    pub const fn from_raw(v: u8) -> Self {
        match v {
            0 => ServoMode::Position,
            1 => ServoMode::Wheel,
            other => ServoMode::Other(other),
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            ServoMode::Position => 0,
            ServoMode::Wheel => 1,
            ServoMode::Other(v) => v,
        }
    }
}

/// Speed word: bit 15 carries direction, bits 0‑14 magnitude.
pub const fn encode_sign_magnitude(speed: i16) -> u16 {
    let mag = speed.unsigned_abs() & !p::SPEED_SIGN_BIT;
    if speed < 0 {
        mag | p::SPEED_SIGN_BIT
    } else {
        mag
    }
}

pub const fn decode_sign_magnitude(raw: u16) -> i16 {
    let mag = (raw & !p::SPEED_SIGN_BIT) as i16;
    if raw & p::SPEED_SIGN_BIT != 0 {
        -mag
    } else {
        mag
    }
}

fn fail(id: Option<u8>, op: &'static str) -> impl FnOnce(CommError) -> ServoError {
    move |e| {
        warn!("{} on {:?} failed: {:?}", op, id, e);
        ServoError::new(id, op, e)
    }
}

fn note_fault(id: u8, op: &'static str, err: StatusError) {
    if !err.is_ok() {
        warn!("servo {} {}: fault bits {}", id, op, err.bits());
    }
}

/* ------------------------------------------------------------------------- */
/*  Main driver struct                                                       */
/* ------------------------------------------------------------------------- */
pub struct FeetechServo<M: RawMutex, T: Transport> {
    bus: ServoBus<M, T>,
}

impl<M: RawMutex, T: Transport> FeetechServo<M, T> {
    pub fn new(transport: T) -> Self {
        Self {
            bus: ServoBus::new(transport),
        }
    }

    pub fn bus(&self) -> &ServoBus<M, T> {
        &self.bus
    }

    /* ================= lifecycle ===================================== */

    pub async fn open(&self, config: LinkConfig) -> Result<(), ServoError> {
        self.bus.open(config).await.map_err(|e| match e {
            CommError::NotAvailable => ServoError::new(None, "connect", ErrorKind::OpenFailed),
            other => ServoError::new(None, "connect", other),
        })
    }

    pub async fn close(&self) -> Result<(), ServoError> {
        self.bus.close().await.map_err(fail(None, "disconnect"))
    }

    /* ================= public API ==================================== */

    /* ---- PING ---- */
    pub async fn ping(&self, id: u8) -> Result<u16, ServoError> {
        let (model, err) = self.bus.ping(id).await.map_err(fail(Some(id), "ping"))?;
        note_fault(id, "ping", err);
        Ok(model)
    }

    /* ---- scan ---- */
    pub async fn scan(&self, first: u8, last: u8) -> ServoIds {
        let mut found = ServoIds::new();
        for id in first..=last.min(p::MAX_STATUS_ID) {
            if self.bus.ping(id).await.is_ok() && found.push(id).is_err() {
                break;
            }
        }
        info!("scan {}..={}: {} servo(s)", first, last, found.len());
        found
    }

    /* ---- raw registers ---- */
    pub async fn read_register(&self, id: u8, address: u8, width: Width) -> Result<u32, ServoError> {
        let op = "read_register";
        let (value, err) = match width {
            Width::Byte => self.bus.read_u8(id, address).await.map(|(v, e)| (v as u32, e)),
            Width::Word => self.bus.read_u16(id, address).await.map(|(v, e)| (v as u32, e)),
            Width::DWord => self.bus.read_u32(id, address).await,
        }
        .map_err(fail(Some(id), op))?;
        note_fault(id, op, err);
        Ok(value)
    }

    pub async fn write_register(
        &self,
        id: u8,
        address: u8,
        width: Width,
        value: u32,
    ) -> Result<(), ServoError> {
        let op = "write_register";
        let limit = match width {
            Width::Byte => u8::MAX as u32,
            Width::Word => u16::MAX as u32,
            Width::DWord => u32::MAX,
        };
        if value > limit {
            return Err(ServoError::new(Some(id), op, ErrorKind::InvalidArgument));
        }
        let err = match width {
            Width::Byte => self.bus.write_u8(id, address, value as u8).await,
            Width::Word => self.bus.write_u16(id, address, value as u16).await,
            Width::DWord => self.bus.write_u32(id, address, value).await,
        }
        .map_err(fail(Some(id), op))?;
        note_fault(id, op, err);
        Ok(())
    }

    /* ---- position / motion ---- */
    pub async fn read_position(&self, id: u8) -> Result<u16, ServoError> {
        let (pos, err) = self
            .bus
            .read_u16(id, p::REG_PRESENT_POSITION_L)
            .await
            .map_err(fail(Some(id), "read_position"))?;
        note_fault(id, "read_position", err);
        Ok(pos)
    }

    pub async fn write_position(&self, id: u8, position: u16) -> Result<(), ServoError> {
        let op = "write_position";
        if position > p::POSITION_MAX {
            return Err(ServoError::new(Some(id), op, ErrorKind::InvalidArgument));
        }
        let err = self
            .bus
            .write_u16(id, p::REG_GOAL_POSITION_L, position)
            .await
            .map_err(fail(Some(id), op))?;
        note_fault(id, op, err);
        Ok(())
    }

    pub async fn set_torque(&self, id: u8, enable: bool) -> Result<(), ServoError> {
        let err = self
            .bus
            .write_u8(id, p::REG_TORQUE_ENABLE, enable as u8)
            .await
            .map_err(fail(Some(id), "set_torque"))?;
        note_fault(id, "set_torque", err);
        Ok(())
    }

    pub async fn set_acceleration(&self, id: u8, acceleration: u8) -> Result<(), ServoError> {
        let err = self
            .bus
            .write_u8(id, p::REG_ACC, acceleration)
            .await
            .map_err(fail(Some(id), "set_acceleration"))?;
        note_fault(id, "set_acceleration", err);
        Ok(())
    }

    /// Goal speed in wheel mode; negative turns the other way.
    pub async fn write_wheel_speed(&self, id: u8, speed: i16) -> Result<(), ServoError> {
        let err = self
            .bus
            .write_u16(id, p::REG_GOAL_SPEED_L, encode_sign_magnitude(speed))
            .await
            .map_err(fail(Some(id), "write_wheel_speed"))?;
        note_fault(id, "write_wheel_speed", err);
        Ok(())
    }

    /* ---- mode & EEPROM ---- */
    pub async fn read_mode(&self, id: u8) -> Result<ServoMode, ServoError> {
        let (raw, err) = self
            .bus
            .read_u8(id, p::REG_MODE)
            .await
            .map_err(fail(Some(id), "read_mode"))?;
        note_fault(id, "read_mode", err);
        Ok(ServoMode::from_raw(raw))
    }

    pub async fn write_mode(&self, id: u8, mode: ServoMode) -> Result<(), ServoError> {
        self.write_locked(id, id, p::REG_MODE, mode.raw(), "write_mode")
            .await
    }

    /// Change the servo's bus id. The re-lock goes to the new id once the id write lands.
    pub async fn set_servo_id(&self, id: u8, new_id: u8) -> Result<(), ServoError> {
        if new_id > p::MAX_ID {
            return Err(ServoError::new(Some(id), "set_servo_id", ErrorKind::InvalidArgument));
        }
        self.write_locked(id, new_id, p::REG_ID, new_id, "set_servo_id")
            .await
    }

    pub async fn set_baud_code(&self, id: u8, code: u8) -> Result<(), ServoError> {
        if p::baud_for_code(code).is_none() {
            return Err(ServoError::new(Some(id), "set_baud_code", ErrorKind::InvalidArgument));
        }
        self.write_locked(id, id, p::REG_BAUD_RATE, code, "set_baud_code")
            .await
    }

    /// unlock → write → re-lock. The re-lock is attempted whenever the unlock
    /// was sent, even if the middle write failed; the first error wins.
    async fn write_locked(
        &self,
        id: u8,
        relock_id: u8,
        address: u8,
        value: u8,
        op: &'static str,
    ) -> Result<(), ServoError> {
        let unlock = self.bus.write_u8(id, p::REG_LOCK, p::LOCK_OFF).await;
        if let Err(CommError::PortBusy | CommError::TxError | CommError::NotAvailable) = unlock {
            // nothing reached the servo
            return unlock.map(|_| ()).map_err(fail(Some(id), op));
        }

        let write = match unlock {
            Ok(_) => self.bus.write_u8(id, address, value).await,
            Err(e) => Err(e),
        };
        let lock_target = if write.is_ok() { relock_id } else { id };
        let relock = self.bus.write_u8(lock_target, p::REG_LOCK, p::LOCK_ON).await;
        if let Err(e) = relock {
            error!("servo {} left unlocked after {}: {:?}", lock_target, op, e);
        }

        unlock.map_err(fail(Some(id), op))?;
        write.map_err(fail(Some(id), op))?;
        relock.map_err(fail(Some(lock_target), op))?;
        Ok(())
    }

    /* ---- batch (sync‑read / sync‑write) ---- */
    pub async fn sync_read_positions(&self, ids: &[u8]) -> Result<ServoMap<u16>, ServoError> {
        let op = "sync_read_positions";
        let mut out = ServoMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let mut group = GroupSyncRead::new(p::REG_PRESENT_POSITION_L, 2).map_err(fail(None, op))?;
        for &id in ids {
            if !group.add_device(id) {
                return Err(ServoError::new(Some(id), op, ErrorKind::InvalidArgument));
            }
        }
        group.tx_rx_packet(&self.bus).await.map_err(fail(None, op))?;
        for &id in ids {
            if !group.is_available(id, p::REG_PRESENT_POSITION_L, 2) {
                return Err(ServoError::new(Some(id), op, CommError::RxCorrupt));
            }
            let pos = group.get_field(id, p::REG_PRESENT_POSITION_L, 2) as u16;
            out.insert(id, pos)
                .map_err(|_| ServoError::new(Some(id), op, ErrorKind::InvalidArgument))?;
        }
        Ok(out)
    }

    pub async fn sync_write_positions(&self, targets: &ServoMap<u16>) -> Result<(), ServoError> {
        let op = "sync_write_positions";
        for (&id, &pos) in targets.iter() {
            if pos > p::POSITION_MAX {
                return Err(ServoError::new(Some(id), op, ErrorKind::InvalidArgument));
            }
        }
        self.sync_write_words(p::REG_GOAL_POSITION_L, targets.iter().map(|(&id, &v)| (id, v)), op)
            .await
    }

    pub async fn sync_write_speeds(&self, targets: &ServoMap<i16>) -> Result<(), ServoError> {
        self.sync_write_words(
            p::REG_GOAL_SPEED_L,
            targets.iter().map(|(&id, &v)| (id, encode_sign_magnitude(v))),
            "sync_write_speeds",
        )
        .await
    }

    async fn sync_write_words(
        &self,
        address: u8,
        targets: impl Iterator<Item = (u8, u16)>,
        op: &'static str,
    ) -> Result<(), ServoError> {
        let order = self.bus.byte_order();
        let mut group = GroupSyncWrite::new(address, 2).map_err(fail(None, op))?;
        for (id, word) in targets {
            if !group.add_device(id, &order.word_bytes(word)) {
                return Err(ServoError::new(Some(id), op, ErrorKind::InvalidArgument));
            }
        }
        if group.is_empty() {
            return Ok(());
        }
        group.tx_packet(&self.bus).await.map_err(fail(None, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::servo::codec::{decode_status, encode_status};
    use crate::drivers::servo::mock::MockTransport;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Servo = FeetechServo<NoopRawMutex, MockTransport>;

    fn open_servo(setup: impl FnOnce(&mut MockTransport)) -> Servo {
        let mut mock = MockTransport::new();
        setup(&mut mock);
        let servo = Servo::new(mock);
        block_on(servo.open(LinkConfig::default())).unwrap();
        servo
    }

    fn ack(id: u8) -> crate::drivers::servo::codec::Frame {
        encode_status(id, 0, &[]).unwrap()
    }

    /// (id, address, first data byte) of every write frame sent.
    fn writes(servo: &Servo) -> std::vec::Vec<(u8, u8, u8)> {
        servo
            .bus()
            .with_transport(|m| {
                m.written()
                    .iter()
                    .map(|f| decode_status(f).unwrap())
                    .filter(|s| s.error.bits() == p::INST_WRITE)
                    .map(|s| (s.id, s.params[0], s.params[1]))
                    .collect()
            })
            .unwrap()
    }

    #[test]
    fn sign_magnitude_speed_words() {
        assert_eq!(encode_sign_magnitude(500), 500);
        assert_eq!(encode_sign_magnitude(-500), 500 | 0x8000);
        assert_eq!(decode_sign_magnitude(500 | 0x8000), -500);
        assert_eq!(decode_sign_magnitude(encode_sign_magnitude(-1)), -1);
    }

    #[test]
    fn write_mode_unlocks_writes_and_relocks() {
        let servo = open_servo(|m| {
            m.queue_reply(&ack(1)).queue_reply(&ack(1)).queue_reply(&ack(1));
        });
        block_on(servo.write_mode(1, ServoMode::Wheel)).unwrap();
        assert_eq!(
            writes(&servo),
            [
                (1, p::REG_LOCK, p::LOCK_OFF),
                (1, p::REG_MODE, 1),
                (1, p::REG_LOCK, p::LOCK_ON)
            ]
        );
    }

    #[test]
    fn failed_mode_write_still_relocks() {
        let servo = open_servo(|m| {
            m.queue_reply(&ack(1)).queue_silence().queue_reply(&ack(1));
        });
        let err = block_on(servo.write_mode(1, ServoMode::Position)).unwrap_err();
        assert_eq!(err.comm(), Some(CommError::RxTimeout));
        assert_eq!(err.op, "write_mode");
        let sent = writes(&servo);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], (1, p::REG_LOCK, p::LOCK_ON));
    }

    #[test]
    fn new_id_is_relocked_at_new_address() {
        let servo = open_servo(|m| {
            m.queue_reply(&ack(1)).queue_reply(&ack(1)).queue_reply(&ack(6));
        });
        block_on(servo.set_servo_id(1, 6)).unwrap();
        assert_eq!(writes(&servo)[2], (6, p::REG_LOCK, p::LOCK_ON));
    }

    #[test]
    fn position_range_is_checked_before_transmit() {
        let servo = open_servo(|_| {});
        let err = block_on(servo.write_position(1, 5000)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(writes(&servo).is_empty());
    }

    #[test]
    fn read_register_widths() {
        let servo = open_servo(|m| {
            m.queue_reply(&encode_status(2, 0, &[7]).unwrap());
            m.queue_reply(&encode_status(2, 0, &[0x01, 0x02, 0x03, 0x04]).unwrap());
        });
        assert_eq!(block_on(servo.read_register(2, 5, Width::Byte)).unwrap(), 7);
        assert_eq!(
            block_on(servo.read_register(2, 60, Width::DWord)).unwrap(),
            0x0403_0201
        );
    }

    #[test]
    fn sync_read_positions_fills_ordered_map() {
        let servo = open_servo(|m| {
            let mut bytes = std::vec::Vec::new();
            bytes.extend_from_slice(&encode_status(2, 0, &[0xD0, 0x07]).unwrap());
            bytes.extend_from_slice(&encode_status(1, 0, &[0xE8, 0x03]).unwrap());
            m.queue_reply(&bytes);
        });
        let map = block_on(servo.sync_read_positions(&[1, 2])).unwrap();
        let pairs: std::vec::Vec<_> = map.iter().map(|(&k, &v)| (k, v)).collect();
        assert_eq!(pairs, [(1, 1000), (2, 2000)]);
    }

    #[test]
    fn sync_read_with_missing_servo_fails() {
        let servo = open_servo(|m| {
            m.queue_reply(&encode_status(1, 0, &[0xE8, 0x03]).unwrap());
        });
        let err = block_on(servo.sync_read_positions(&[1, 2])).unwrap_err();
        assert_eq!(err.comm(), Some(CommError::RxTimeout));
    }

    #[test]
    fn sync_write_speeds_uses_sign_magnitude() {
        let servo = open_servo(|_| {});
        let mut targets = ServoMap::new();
        targets.insert(1, -100).unwrap();
        targets.insert(2, 100).unwrap();
        block_on(servo.sync_write_speeds(&targets)).unwrap();
        servo
            .bus()
            .with_transport(|m| {
                let f = &m.written()[0];
                assert_eq!(&f[5..13], &[p::REG_GOAL_SPEED_L, 2, 1, 100, 0x80, 2, 100, 0x00]);
            })
            .unwrap();
    }

    #[test]
    fn scan_collects_responders() {
        let servo = open_servo(|m| {
            // id 1: ping + model read; id 2 silent; id 3: ping + model read
            m.queue_reply(&ack(1));
            m.queue_reply(&encode_status(1, 0, &[0x09, 0x03]).unwrap());
            m.queue_silence();
            m.queue_reply(&ack(3));
            m.queue_reply(&encode_status(3, 0, &[0x09, 0x03]).unwrap());
        });
        let found = block_on(servo.scan(1, 3));
        assert_eq!(found.as_slice(), &[1, 3]);
    }
}
