//! Packet transactor
//! ==================
//!
//! One `ServoBus` owns one [`Transport`]. Every transaction takes the port
//! gate with `try_lock`; a second transaction arriving while the first is on
//! the wire gets [`CommError::PortBusy`] straight away. Queueing is the job of
//! the command hub, not of the bus.
//!
//! A transaction is a single attempt: flush input, write, then (unless the
//! target is broadcast) assemble one status frame before a deadline sized
//! from the expected reply length and the baud rate.

use core::cell::Cell;

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Instant};
use heapless::Vec;

use super::codec::{self, ByteOrder, Instruction, Params, StatusPacket};
use super::error::{CommError, StatusError};
use super::protocol::{self as p, idx};
use super::transport::Transport;
use crate::config::{LinkConfig, RX_POLL_INTERVAL_US};

/// Reply-time allowance for a non-read status frame, in bytes.
const STATUS_TIMEOUT_BYTES: usize = 10;

/// Time budget for `bytes` to arrive: wire time at `baud_rate` (10 bits per
/// byte) plus twice the latency timer plus 2 ms.
pub fn packet_timeout(baud_rate: u32, latency_timer_ms: u64, bytes: usize) -> Duration {
    let per_byte_us = 10_000_000 / baud_rate.max(1) as u64;
    Duration::from_micros(per_byte_us * bytes as u64 + (latency_timer_ms * 2 + 2) * 1_000)
}

struct Port<T> {
    transport: T,
    open: bool,
    config: LinkConfig,
    deadline: Instant,
    /// Bytes received past the end of the last frame; consumed by the next `rx_packet`.
    residue: Vec<u8, { p::RXPACKET_MAX_LEN }>,
}

/// The packet transactor.
pub struct ServoBus<M: RawMutex, T: Transport> {
    port: Mutex<M, Port<T>>,
    config: BlockingMutex<M, Cell<LinkConfig>>,
    /// Last lifecycle outcome, readable while a transaction holds the gate.
    link_open: BlockingMutex<M, Cell<bool>>,
}

impl<M: RawMutex, T: Transport> ServoBus<M, T> {
    pub fn new(transport: T) -> Self {
        let config = LinkConfig::default();
        Self {
            port: Mutex::new(Port {
                transport,
                open: false,
                config,
                deadline: Instant::now(),
                residue: Vec::new(),
            }),
            config: BlockingMutex::new(Cell::new(config)),
            link_open: BlockingMutex::new(Cell::new(false)),
        }
    }

    /// Byte order of the current (or last) link.
    pub fn byte_order(&self) -> ByteOrder {
        self.config.lock(|c| c.get()).byte_order
    }

    pub fn link_config(&self) -> LinkConfig {
        self.config.lock(|c| c.get())
    }

    /* ================= lifecycle ===================================== */

    pub async fn open(&self, config: LinkConfig) -> Result<(), CommError> {
        let mut port = self.port.try_lock().map_err(|_| CommError::PortBusy)?;
        if !port.transport.open(config.baud_rate).await {
            warn!("transport refused to open at {} baud", config.baud_rate);
            port.open = false;
            self.link_open.lock(|o| o.set(false));
            return Err(CommError::NotAvailable);
        }
        port.open = true;
        self.link_open.lock(|o| o.set(true));
        port.config = config;
        port.residue.clear();
        self.config.lock(|c| c.set(config));
        info!(
            "servo bus open: {} baud, {:?}",
            config.baud_rate, config.byte_order
        );
        Ok(())
    }

    pub async fn close(&self) -> Result<(), CommError> {
        let mut port = self.port.try_lock().map_err(|_| CommError::PortBusy)?;
        if port.open {
            self.link_open.lock(|o| o.set(false));
            port.transport.close().await;
            port.open = false;
            info!("servo bus closed");
        }
        Ok(())
    }

    /// False as soon as a `close` starts, even before it releases the gate.
    pub fn is_open(&self) -> bool {
        self.link_open.lock(|o| o.get())
    }

    /// Take the port gate for a multi-frame exchange.
    pub fn session(&self) -> Result<PortSession<'_, M, T>, CommError> {
        let guard = self.port.try_lock().map_err(|_| CommError::PortBusy)?;
        if !guard.open {
            return Err(CommError::NotAvailable);
        }
        Ok(PortSession { port: guard })
    }

    /// Run `f` on the transport while no transaction is in flight.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, CommError> {
        let mut port = self.port.try_lock().map_err(|_| CommError::PortBusy)?;
        Ok(f(&mut port.transport))
    }

    /* ================= single-device transactions ==================== */

    /// Send one instruction and, unless broadcast, wait for its status frame.
    pub async fn tx_rx_packet(
        &self,
        id: u8,
        inst: Instruction,
        params: &[u8],
    ) -> Result<StatusPacket, CommError> {
        let mut session = self.session()?;
        session.tx_rx_packet(id, inst, params).await
    }

    /// Send one instruction without waiting for any reply.
    pub async fn tx_only(&self, id: u8, inst: Instruction, params: &[u8]) -> Result<(), CommError> {
        let frame = codec::encode_instruction(id, inst, params)?;
        let mut session = self.session()?;
        session.tx_packet(&frame).await
    }

    /* ---- PING ---- */
    /// Ping `id`, then read its model number.
    pub async fn ping(&self, id: u8) -> Result<(u16, StatusError), CommError> {
        if id >= p::BROADCAST_ID {
            return Err(CommError::NotAvailable);
        }
        self.tx_rx_packet(id, Instruction::Ping, &[]).await?;
        self.read_u16(id, p::REG_MODEL).await
    }

    pub async fn action(&self, id: u8) -> Result<StatusError, CommError> {
        Ok(self.tx_rx_packet(id, Instruction::Action, &[]).await?.error)
    }

    /* ---- READ ---- */
    pub async fn read(&self, id: u8, address: u8, length: u8) -> Result<StatusPacket, CommError> {
        if id >= p::BROADCAST_ID || length as usize > p::MAX_DATA_LEN {
            return Err(CommError::NotAvailable);
        }
        self.tx_rx_packet(id, Instruction::Read, &[address, length]).await
    }

    pub async fn read_u8(&self, id: u8, address: u8) -> Result<(u8, StatusError), CommError> {
        let status = self.read(id, address, 1).await?;
        Ok((status.params[0], status.error))
    }

    pub async fn read_u16(&self, id: u8, address: u8) -> Result<(u16, StatusError), CommError> {
        let status = self.read(id, address, 2).await?;
        let word = self.byte_order().compose(&status.params, 2) as u16;
        Ok((word, status.error))
    }

    pub async fn read_u32(&self, id: u8, address: u8) -> Result<(u32, StatusError), CommError> {
        let status = self.read(id, address, 4).await?;
        Ok((self.byte_order().compose(&status.params, 4), status.error))
    }

    /* ---- WRITE ---- */
    pub async fn write(&self, id: u8, address: u8, data: &[u8]) -> Result<StatusError, CommError> {
        let params = address_prefixed(address, data)?;
        Ok(self.tx_rx_packet(id, Instruction::Write, &params).await?.error)
    }

    pub async fn write_tx_only(&self, id: u8, address: u8, data: &[u8]) -> Result<(), CommError> {
        let params = address_prefixed(address, data)?;
        self.tx_only(id, Instruction::Write, &params).await
    }

    pub async fn write_u8(&self, id: u8, address: u8, value: u8) -> Result<StatusError, CommError> {
        self.write(id, address, &[value]).await
    }

    pub async fn write_u16(&self, id: u8, address: u8, value: u16) -> Result<StatusError, CommError> {
        let bytes = self.byte_order().word_bytes(value);
        self.write(id, address, &bytes).await
    }

    pub async fn write_u32(&self, id: u8, address: u8, value: u32) -> Result<StatusError, CommError> {
        let bytes = self.byte_order().dword_bytes(value);
        self.write(id, address, &bytes).await
    }

    /// Stage a write that takes effect on the next `action`.
    pub async fn reg_write(&self, id: u8, address: u8, data: &[u8]) -> Result<StatusError, CommError> {
        let params = address_prefixed(address, data)?;
        Ok(self.tx_rx_packet(id, Instruction::RegWrite, &params).await?.error)
    }

    /* ---- SYNC WRITE ---- */
    /// One broadcast frame: `start, len, id0, data0.., id1, data1.., ..`. No reply.
    pub async fn sync_write_tx_only(
        &self,
        start_address: u8,
        data_length: u8,
        param: &[u8],
    ) -> Result<(), CommError> {
        let mut params = Vec::<u8, { p::TXPACKET_MAX_LEN }>::new();
        params
            .extend_from_slice(&[start_address, data_length])
            .map_err(|_| CommError::TxError)?;
        params.extend_from_slice(param).map_err(|_| CommError::TxError)?;
        self.tx_only(p::BROADCAST_ID, Instruction::SyncWrite, &params).await
    }
}

fn address_prefixed(address: u8, data: &[u8]) -> Result<Vec<u8, { p::TXPACKET_MAX_LEN }>, CommError> {
    let mut params = Vec::new();
    params.push(address).map_err(|_| CommError::TxError)?;
    params.extend_from_slice(data).map_err(|_| CommError::TxError)?;
    Ok(params)
}

/* ------------------------------------------------------------------------- */
/*  Port session: the gate is held for the session's lifetime                */
/* ------------------------------------------------------------------------- */
pub struct PortSession<'a, M: RawMutex, T: Transport> {
    port: MutexGuard<'a, M, Port<T>>,
}

impl<M: RawMutex, T: Transport> PortSession<'_, M, T> {
    pub fn byte_order(&self) -> ByteOrder {
        self.port.config.byte_order
    }

    /// Flush stale input, then transmit `frame` in full.
    pub async fn tx_packet(&mut self, frame: &[u8]) -> Result<(), CommError> {
        if frame.len() > p::TXPACKET_MAX_LEN {
            return Err(CommError::TxError);
        }
        let port = &mut *self.port;
        port.residue.clear();
        port.transport.flush_input().await;
        let sent = port.transport.write(frame).await;
        if sent != frame.len() {
            warn!("tx short: {} of {} bytes", sent, frame.len());
            return Err(CommError::TxFail);
        }
        Ok(())
    }

    /// Start the receive deadline for `bytes` of expected reply.
    pub fn set_packet_timeout(&mut self, bytes: usize) {
        let cfg = self.port.config;
        self.port.deadline = Instant::now() + packet_timeout(cfg.baud_rate, cfg.latency_timer_ms, bytes);
    }

    fn timed_out(&self) -> bool {
        Instant::now() >= self.port.deadline
    }

    /// Assemble one status frame before the current deadline.
    ///
    /// Reads only the bytes still missing, resynchronizes on the next `FF FF`
    /// when garbage precedes a header, and trusts the length the frame
    /// declares over any earlier guess.
    pub async fn rx_packet(&mut self) -> Result<StatusPacket, CommError> {
        let mut rx = core::mem::take(&mut self.port.residue);
        let mut wait_length = p::STATUS_MIN_LEN;

        loop {
            if rx.len() < wait_length {
                if self.timed_out() {
                    let err = if rx.is_empty() {
                        CommError::RxTimeout
                    } else {
                        CommError::RxCorrupt
                    };
                    debug!("rx gave up with {} bytes: {:?}", rx.len(), err);
                    return Err(err);
                }

                let have = rx.len();
                rx.resize(wait_length, 0).map_err(|_| CommError::RxCorrupt)?;
                let remaining = self.port.deadline.saturating_duration_since(Instant::now());
                let hint = remaining.min(Duration::from_micros(RX_POLL_INTERVAL_US));
                let n = self.port.transport.read(&mut rx[have..], hint).await;
                rx.truncate(have + n.min(wait_length - have));
                if n == 0 {
                    yield_now().await;
                }
                continue;
            }

            match rx.windows(2).position(|w| w == p::HEADER) {
                Some(0) => {
                    let len_field = rx[idx::LENGTH] as usize;
                    if rx[idx::ID] > p::MAX_STATUS_ID
                        || len_field < 2
                        || len_field + 4 > p::RXPACKET_MAX_LEN
                        || rx[idx::ERROR] > 0x7F
                    {
                        // a data byte pair that only looks like a header
                        rx.remove(0);
                        continue;
                    }
                    let total = len_field + 4;
                    if wait_length != total {
                        wait_length = total;
                        if rx.len() < total {
                            continue;
                        }
                    }

                    let status = codec::decode_status(&rx[..total]);
                    if rx.len() > total {
                        let _ = self.port.residue.extend_from_slice(&rx[total..]);
                    }
                    if status.is_err() {
                        warn!("rx checksum mismatch from id {}", rx[idx::ID]);
                    }
                    return status;
                }
                Some(skip) => {
                    trace!("rx resync: dropped {} bytes", skip);
                    rx.copy_within(skip.., 0);
                    rx.truncate(rx.len() - skip);
                }
                None => {
                    rx.remove(0);
                }
            }
        }
    }

    /// Full single-device exchange on an already held port.
    pub async fn tx_rx_packet(
        &mut self,
        id: u8,
        inst: Instruction,
        params: &[u8],
    ) -> Result<StatusPacket, CommError> {
        let frame = codec::encode_instruction(id, inst, params)?;
        self.tx_packet(&frame).await?;

        if id == p::BROADCAST_ID {
            return Ok(StatusPacket {
                id,
                error: StatusError::NONE,
                params: Params::new(),
            });
        }

        let expected_data = match inst {
            Instruction::Read => params.get(1).copied().unwrap_or(0) as usize,
            _ => 0,
        };
        match inst {
            Instruction::Read => self.set_packet_timeout(expected_data + p::STATUS_MIN_LEN),
            _ => self.set_packet_timeout(STATUS_TIMEOUT_BYTES),
        }

        let status = self.rx_packet().await?;
        if status.id != id {
            warn!("reply from id {} to a request for {}", status.id, id);
            return Err(CommError::RxCorrupt);
        }
        if inst == Instruction::Read && status.params.len() != expected_data {
            return Err(CommError::RxCorrupt);
        }
        if !status.error.is_ok() {
            warn!("servo {} reports fault bits {}", id, status.error.bits());
        }
        Ok(status)
    }
}
