//! Sync-write: per-servo payloads packed into one broadcast frame, no reply.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use super::bus::ServoBus;
use super::error::CommError;
use super::protocol as p;
use super::transport::Transport;
use crate::config::MAX_SERVOS;

type Payload = Vec<u8, { p::MAX_DATA_LEN }>;

/// A reusable sync-write session. Every payload is exactly `data_length` bytes.
pub struct GroupSyncWrite {
    start_address: u8,
    data_length: u8,
    devices: Vec<(u8, Payload), MAX_SERVOS>,
}

impl GroupSyncWrite {
    /// `TxError` when even a single member's payload would not fit in one frame.
    pub fn new(start_address: u8, data_length: u8) -> Result<Self, CommError> {
        // start, length, then one id byte ahead of the payload
        if data_length as usize + 3 > p::MAX_DATA_LEN {
            return Err(CommError::TxError);
        }
        Ok(Self {
            start_address,
            data_length,
            devices: Vec::new(),
        })
    }

    pub fn start_address(&self) -> u8 {
        self.start_address
    }

    pub fn data_length(&self) -> u8 {
        self.data_length
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn payload(&self, data: &[u8]) -> Option<Payload> {
        if data.len() != self.data_length as usize {
            return None;
        }
        Payload::from_slice(data).ok()
    }

    /// Rejects duplicates, bad ids and wrong-length payloads without touching the session.
    pub fn add_device(&mut self, id: u8, data: &[u8]) -> bool {
        if id > p::MAX_ID || self.devices.iter().any(|(d, _)| *d == id) {
            return false;
        }
        match self.payload(data) {
            Some(payload) => self.devices.push((id, payload)).is_ok(),
            None => false,
        }
    }

    pub fn update_device(&mut self, id: u8, data: &[u8]) -> bool {
        let Some(payload) = self.payload(data) else {
            return false;
        };
        match self.devices.iter_mut().find(|(d, _)| *d == id) {
            Some((_, slot)) => {
                *slot = payload;
                true
            }
            None => false,
        }
    }

    pub fn remove_device(&mut self, id: u8) -> bool {
        match self.devices.iter().position(|(d, _)| *d == id) {
            Some(i) => {
                self.devices.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Parameter stream `id0, data0.., id1, data1.., ..` in insertion order.
    fn param_stream(&self) -> Result<Vec<u8, { p::TXPACKET_MAX_LEN }>, CommError> {
        let mut out = Vec::new();
        for (id, data) in self.devices.iter() {
            out.push(*id).map_err(|_| CommError::TxError)?;
            out.extend_from_slice(data).map_err(|_| CommError::TxError)?;
        }
        Ok(out)
    }

    /// Transmit once. Only transmit-level failures are reported.
    pub async fn tx_packet<M: RawMutex, T: Transport>(&self, bus: &ServoBus<M, T>) -> Result<(), CommError> {
        if self.devices.is_empty() {
            return Err(CommError::NotAvailable);
        }
        let stream = self.param_stream()?;
        bus.sync_write_tx_only(self.start_address, self.data_length, &stream)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::drivers::servo::codec::checksum;
    use crate::drivers::servo::mock::MockTransport;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Bus = ServoBus<NoopRawMutex, MockTransport>;

    #[test]
    fn wrong_length_payload_is_rejected() {
        let mut group = GroupSyncWrite::new(42, 2).unwrap();
        assert!(!group.add_device(1, &[0xE8]));
        assert!(group.is_empty());
        assert!(group.add_device(1, &[0xE8, 0x03]));
        assert!(!group.add_device(1, &[0x00, 0x00]));
        assert!(!group.update_device(1, &[0x00, 0x00, 0x00]));
        assert!(!group.update_device(2, &[0x00, 0x00]));
        assert!(group.update_device(1, &[0xD0, 0x07]));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn two_devices_share_one_frame_without_waiting() {
        let bus = Bus::new(MockTransport::new());
        block_on(bus.open(LinkConfig::default())).unwrap();

        let mut group = GroupSyncWrite::new(42, 2).unwrap();
        assert!(group.add_device(1, &[0xE8, 0x03]));
        assert!(group.add_device(2, &[0xD0, 0x07]));
        block_on(group.tx_packet(&bus)).unwrap();

        bus.with_transport(|m| {
            assert_eq!(m.written().len(), 1);
            assert_eq!(m.reads(), 0);
            let f = &m.written()[0];
            assert_eq!(&f[..7], &[0xFF, 0xFF, p::BROADCAST_ID, 10, p::INST_SYNC_WRITE, 42, 2]);
            assert_eq!(&f[7..13], &[0x01, 0xE8, 0x03, 0x02, 0xD0, 0x07]);
            assert_eq!(f[13], checksum(&f[2..13]));
        })
        .unwrap();
    }

    #[test]
    fn oversize_payload_window_is_rejected() {
        assert!(GroupSyncWrite::new(0, (p::MAX_DATA_LEN - 3) as u8).is_ok());
        assert_eq!(
            GroupSyncWrite::new(0, (p::MAX_DATA_LEN - 2) as u8).err(),
            Some(CommError::TxError)
        );
        let mut group = GroupSyncWrite::new(42, 1).unwrap();
        assert!(group.add_device(p::MAX_ID, &[0]));
        assert!(!group.add_device(p::MAX_ID + 1, &[0]));
    }

    #[test]
    fn removal_keeps_insertion_order() {
        let mut group = GroupSyncWrite::new(46, 1).unwrap();
        group.add_device(3, &[30]);
        group.add_device(1, &[10]);
        group.add_device(2, &[20]);
        assert!(group.remove_device(1));
        assert!(!group.remove_device(1));
        assert_eq!(group.param_stream().unwrap().as_slice(), &[3, 30, 2, 20]);
    }

    #[test]
    fn empty_group_is_not_available() {
        let bus = Bus::new(MockTransport::new());
        block_on(bus.open(LinkConfig::default())).unwrap();
        let group = GroupSyncWrite::new(42, 2).unwrap();
        assert_eq!(block_on(group.tx_packet(&bus)), Err(CommError::NotAvailable));
    }

    #[test]
    fn short_transmit_is_reported() {
        let mut mock = MockTransport::new();
        mock.set_short_writes(true);
        let bus = Bus::new(mock);
        block_on(bus.open(LinkConfig::default())).unwrap();
        let mut group = GroupSyncWrite::new(42, 2).unwrap();
        group.add_device(1, &[0, 0]);
        assert_eq!(block_on(group.tx_packet(&bus)), Err(CommError::TxFail));
    }
}
