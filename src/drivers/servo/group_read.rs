//! Sync-read: one broadcast request, one status frame back per servo.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use super::bus::ServoBus;
use super::codec::{self, ByteOrder, Instruction};
use super::error::{CommError, StatusError};
use super::protocol as p;
use super::transport::Transport;
use crate::config::MAX_SERVOS;

struct ReadSlot {
    id: u8,
    data: Vec<u8, { p::MAX_DATA_LEN }>,
    error: StatusError,
    filled: bool,
}

/// A reusable sync-read session over one register window.
pub struct GroupSyncRead {
    start_address: u8,
    data_length: u8,
    order: ByteOrder,
    devices: Vec<ReadSlot, MAX_SERVOS>,
}

impl GroupSyncRead {
    /// Window `[start_address, start_address + data_length)`, shared by every member.
    /// A window whose reply would not fit in one status frame is `TxError`.
    pub fn new(start_address: u8, data_length: u8) -> Result<Self, CommError> {
        if data_length as usize > p::MAX_DATA_LEN {
            return Err(CommError::TxError);
        }
        Ok(Self {
            start_address,
            data_length,
            order: ByteOrder::default(),
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

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.devices.iter().map(|d| d.id)
    }

    fn slot(&self, id: u8) -> Option<&ReadSlot> {
        self.devices.iter().find(|d| d.id == id)
    }

    /* ---- membership ---- */
    pub fn add_device(&mut self, id: u8) -> bool {
        if id > p::MAX_ID || self.slot(id).is_some() {
            return false;
        }
        let mut data = Vec::new();
        // fits: data_length is bounded in `new`
        let _ = data.resize(self.data_length as usize, 0);
        self.devices
            .push(ReadSlot {
                id,
                data,
                error: StatusError::NONE,
                filled: false,
            })
            .is_ok()
    }

    pub fn remove_device(&mut self, id: u8) -> bool {
        match self.devices.iter().position(|d| d.id == id) {
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

    /* ---- transaction ---- */
    /// Broadcast the request and collect one reply per member.
    ///
    /// Every member's buffer is zeroed first. Replies are committed as they are
    /// decoded, so on failure members that already answered keep this pass's
    /// data, but the call still reports the failure.
    pub async fn tx_rx_packet<M: RawMutex, T: Transport>(
        &mut self,
        bus: &ServoBus<M, T>,
    ) -> Result<(), CommError> {
        if self.devices.is_empty() {
            return Err(CommError::NotAvailable);
        }

        let mut params = Vec::<u8, { p::TXPACKET_MAX_LEN }>::new();
        params
            .extend_from_slice(&[self.start_address, self.data_length])
            .map_err(|_| CommError::TxError)?;
        for d in self.devices.iter() {
            params.push(d.id).map_err(|_| CommError::TxError)?;
        }
        let frame = codec::encode_instruction(p::BROADCAST_ID, Instruction::SyncRead, &params)?;

        let mut session = bus.session()?;
        self.order = session.byte_order();
        for d in self.devices.iter_mut() {
            d.data.clear();
            // resize within capacity: data_length is bounded in `new`
            let _ = d.data.resize(self.data_length as usize, 0);
            d.error = StatusError::NONE;
            d.filled = false;
        }

        session.tx_packet(&frame).await?;
        session.set_packet_timeout((p::STATUS_MIN_LEN + self.data_length as usize) * self.devices.len());

        for _ in 0..self.devices.len() {
            let status = session.rx_packet().await?;
            let Some(slot) = self.devices.iter_mut().find(|d| d.id == status.id) else {
                warn!("sync read: reply from unexpected id {}", status.id);
                return Err(CommError::RxCorrupt);
            };
            if slot.filled || status.params.len() != self.data_length as usize {
                return Err(CommError::RxCorrupt);
            }
            slot.data.clear();
            let _ = slot.data.extend_from_slice(&status.params);
            slot.error = status.error;
            slot.filled = true;
            if !status.error.is_ok() {
                warn!("servo {} reports fault bits {}", status.id, status.error.bits());
            }
        }
        Ok(())
    }

    /* ---- extraction ---- */
    /// True when `id` answered the last pass and `[address, address + width)` lies in the window.
    pub fn is_available(&self, id: u8, address: u8, width: u8) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let start = self.start_address as u16;
        let end = start + self.data_length as u16;
        let addr = address as u16;
        slot.filled && addr >= start && addr + width as u16 <= end
    }

    /// 1/2/4-byte field at `address`, composed in the bus byte order.
    /// Zero when the device is absent or the field lies outside the window;
    /// check [`is_available`](Self::is_available) first.
    pub fn get_field(&self, id: u8, address: u8, width: u8) -> u32 {
        let Some(slot) = self.slot(id) else {
            return 0;
        };
        let start = self.start_address as usize;
        let addr = address as usize;
        if addr < start || addr + width as usize > start + self.data_length as usize {
            return 0;
        }
        slot.data
            .get(addr - start..)
            .map_or(0, |field| self.order.compose(field, width))
    }

    /// Fault bits of `id`'s reply in the last pass.
    pub fn device_error(&self, id: u8) -> Option<StatusError> {
        self.slot(id).filter(|s| s.filled).map(|s| s.error)
    }
}
