//! Servo hub
//! =========
//!
//! Callers on any task enqueue [`Request`]s; one worker ([`ServoHub::run`])
//! drains the queue and executes them one at a time against the bus, so
//! concurrent callers never see `PortBusy`. Each caller parks on its own
//! reply slot until the worker signals it.
//!
//! A caller future dropped while parked does not cancel its request. The
//! worker still runs it, discards the reply and puts the slot back.

use core::cell::Cell;
use core::convert::Infallible;
use core::future::Future;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::config::{LinkConfig, COMMAND_QUEUE_DEPTH, SCAN_MAX_ID};
use crate::drivers::servo::codec::ByteOrder;
use crate::drivers::servo::driver::{FeetechServo, ServoIds, ServoMap, ServoMode, Width};
use crate::drivers::servo::error::{ErrorKind, ServoError};
use crate::drivers::servo::transport::Transport;
use crate::ipc::{Command, Reply, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

type ReplySlot<M> = Signal<M, Result<Reply, ServoError>>;

// one bit per reply slot in `abandoned`
const _: () = assert!(COMMAND_QUEUE_DEPTH <= 32);

pub struct ServoHub<M: RawMutex, T: Transport> {
    servo: FeetechServo<M, T>,
    queue: Channel<M, Command, COMMAND_QUEUE_DEPTH>,
    slots: [ReplySlot<M>; COMMAND_QUEUE_DEPTH],
    free: Channel<M, u8, COMMAND_QUEUE_DEPTH>,
    /// Slots whose caller went away before the reply arrived.
    abandoned: BlockingMutex<M, Cell<u32>>,
    state: BlockingMutex<M, Cell<LinkState>>,
}

/// A checked-out reply slot. Dropping it hands the slot back, or, when the
/// worker still owes a reply on it, marks it for the worker to hand back.
struct SlotLease<'a, M: RawMutex, T: Transport> {
    hub: &'a ServoHub<M, T>,
    slot: u8,
    queued: bool,
    answered: bool,
}

impl<M: RawMutex, T: Transport> Drop for SlotLease<'_, M, T> {
    fn drop(&mut self) {
        let hub = self.hub;
        let slot = self.slot;
        if self.queued && !self.answered {
            let pending = hub.abandoned.lock(|a| {
                if hub.slots[slot as usize].signaled() {
                    return false;
                }
                a.set(a.get() | 1 << slot);
                true
            });
            if pending {
                debug!("reply slot {} abandoned while queued", slot);
                return;
            }
        }
        let _ = hub.free.try_send(slot);
    }
}

fn unexpected(id: Option<u8>, op: &'static str) -> ServoError {
    ServoError::new(id, op, ErrorKind::UnexpectedReply)
}

impl<M: RawMutex, T: Transport> ServoHub<M, T> {
    pub fn new(transport: T) -> Self {
        let free = Channel::new();
        for i in 0..COMMAND_QUEUE_DEPTH {
            let _ = free.try_send(i as u8);
        }
        Self {
            servo: FeetechServo::new(transport),
            queue: Channel::new(),
            slots: core::array::from_fn(|_| Signal::new()),
            free,
            abandoned: BlockingMutex::new(Cell::new(0)),
            state: BlockingMutex::new(Cell::new(LinkState::Disconnected)),
        }
    }

    pub fn servo(&self) -> &FeetechServo<M, T> {
        &self.servo
    }

    pub fn link_state(&self) -> LinkState {
        self.state.lock(|s| s.get())
    }

    fn set_link_state(&self, next: LinkState) {
        self.state.lock(|s| s.set(next));
    }

    /* ================= worker ======================================== */

    /// Drain the queue forever.
    pub async fn run(&self) -> Infallible {
        info!("servo hub worker started");
        loop {
            let Command { request, slot } = self.queue.receive().await;
            let reply = self.execute(request).await;
            let orphan = self.abandoned.lock(|a| {
                let bit = 1u32 << slot;
                if a.get() & bit != 0 {
                    a.set(a.get() & !bit);
                    return true;
                }
                if let Some(s) = self.slots.get(slot as usize) {
                    s.signal(reply);
                }
                false
            });
            if orphan {
                let _ = self.free.try_send(slot);
            }
        }
    }

    /// Drive the worker alongside `fut` until `fut` completes.
    pub async fn run_until<F: Future>(&self, fut: F) -> F::Output {
        match select(self.run(), fut).await {
            Either::First(never) => match never {},
            Either::Second(out) => out,
        }
    }

    async fn execute(&self, request: Request) -> Result<Reply, ServoError> {
        // a disconnect queued ahead of this request may have taken the bus down
        if !request.is_lifecycle() && self.link_state() != LinkState::Connected {
            return Err(ServoError::new(request.target(), request.op(), ErrorKind::NotConnected));
        }

        let s = &self.servo;
        match request {
            Request::Connect(config) => {
                let res = s.open(config).await;
                match res {
                    Ok(()) => {
                        self.set_link_state(LinkState::Connected);
                        info!("servo hub connected");
                    }
                    Err(_) => self.set_link_state(LinkState::Disconnected),
                }
                res.map(|_| Reply::Done)
            }
            Request::Disconnect => {
                let res = s.close().await;
                self.set_link_state(LinkState::Disconnected);
                info!("servo hub disconnected");
                res.map(|_| Reply::Done)
            }
            Request::Ping { id } => s.ping(id).await.map(Reply::Model),
            Request::Scan { first, last } => Ok(Reply::Ids(s.scan(first, last).await)),
            Request::ReadRegister { id, address, width } => {
                s.read_register(id, address, width).await.map(Reply::Value)
            }
            Request::WriteRegister { id, address, width, value } => s
                .write_register(id, address, width, value)
                .await
                .map(|_| Reply::Done),
            Request::ReadPosition { id } => s.read_position(id).await.map(Reply::Position),
            Request::WritePosition { id, position } => {
                s.write_position(id, position).await.map(|_| Reply::Done)
            }
            Request::SetTorque { id, enable } => s.set_torque(id, enable).await.map(|_| Reply::Done),
            Request::ReadMode { id } => s.read_mode(id).await.map(Reply::Mode),
            Request::WriteMode { id, mode } => s.write_mode(id, mode).await.map(|_| Reply::Done),
            Request::SetAcceleration { id, acceleration } => s
                .set_acceleration(id, acceleration)
                .await
                .map(|_| Reply::Done),
            Request::WriteWheelSpeed { id, speed } => {
                s.write_wheel_speed(id, speed).await.map(|_| Reply::Done)
            }
            Request::SetServoId { id, new_id } => s.set_servo_id(id, new_id).await.map(|_| Reply::Done),
            Request::SetBaudCode { id, code } => s.set_baud_code(id, code).await.map(|_| Reply::Done),
            Request::SyncReadPositions { ids } => {
                s.sync_read_positions(&ids).await.map(Reply::Positions)
            }
            Request::SyncWritePositions { targets } => {
                s.sync_write_positions(&targets).await.map(|_| Reply::Done)
            }
            Request::SyncWriteSpeeds { targets } => {
                s.sync_write_speeds(&targets).await.map(|_| Reply::Done)
            }
        }
    }

    /* ================= client side =================================== */

    /// Enqueue `request` and wait for the worker's answer.
    pub async fn submit(&self, request: Request) -> Result<Reply, ServoError> {
        let mut lease = SlotLease {
            hub: self,
            slot: self.free.receive().await,
            queued: false,
            answered: false,
        };
        let signal = &self.slots[lease.slot as usize];
        signal.reset();
        self.queue
            .send(Command {
                request,
                slot: lease.slot,
            })
            .await;
        lease.queued = true;
        let reply = signal.wait().await;
        lease.answered = true;
        reply
    }

    /// Device operations fail fast while the link is not up.
    async fn call(&self, request: Request) -> Result<Reply, ServoError> {
        if self.link_state() != LinkState::Connected {
            return Err(ServoError::new(request.target(), request.op(), ErrorKind::NotConnected));
        }
        self.submit(request).await
    }

    async fn call_done(&self, request: Request) -> Result<(), ServoError> {
        let (id, op) = (request.target(), request.op());
        match self.call(request).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected(id, op)),
        }
    }

    /* ---- lifecycle ---- */
    pub async fn connect(&self, baud_rate: u32, byte_order: ByteOrder) -> Result<(), ServoError> {
        self.connect_with(LinkConfig::new(baud_rate, byte_order)).await
    }

    pub async fn connect_with(&self, config: LinkConfig) -> Result<(), ServoError> {
        let claimed = self.state.lock(|s| {
            if s.get() != LinkState::Disconnected {
                return false;
            }
            s.set(LinkState::Connecting);
            true
        });
        if !claimed {
            return Err(ServoError::new(None, "connect", ErrorKind::AlreadyConnected));
        }
        match self.submit(Request::Connect(config)).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected(None, "connect")),
        }
    }

    pub async fn disconnect(&self) -> Result<(), ServoError> {
        if self.link_state() == LinkState::Disconnected {
            return Ok(());
        }
        match self.submit(Request::Disconnect).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected(None, "disconnect")),
        }
    }

    /* ---- single servo ---- */
    pub async fn ping(&self, id: u8) -> Result<u16, ServoError> {
        match self.call(Request::Ping { id }).await? {
            Reply::Model(model) => Ok(model),
            _ => Err(unexpected(Some(id), "ping")),
        }
    }

    pub async fn scan(&self) -> Result<ServoIds, ServoError> {
        self.scan_range(0, SCAN_MAX_ID).await
    }

    pub async fn scan_range(&self, first: u8, last: u8) -> Result<ServoIds, ServoError> {
        match self.call(Request::Scan { first, last }).await? {
            Reply::Ids(ids) => Ok(ids),
            _ => Err(unexpected(None, "scan")),
        }
    }

    pub async fn read_register(&self, id: u8, address: u8, width: Width) -> Result<u32, ServoError> {
        match self.call(Request::ReadRegister { id, address, width }).await? {
            Reply::Value(v) => Ok(v),
            _ => Err(unexpected(Some(id), "read_register")),
        }
    }

    pub async fn write_register(
        &self,
        id: u8,
        address: u8,
        width: Width,
        value: u32,
    ) -> Result<(), ServoError> {
        self.call_done(Request::WriteRegister { id, address, width, value })
            .await
    }

    pub async fn read_position(&self, id: u8) -> Result<u16, ServoError> {
        match self.call(Request::ReadPosition { id }).await? {
            Reply::Position(p) => Ok(p),
            _ => Err(unexpected(Some(id), "read_position")),
        }
    }

    pub async fn write_position(&self, id: u8, position: u16) -> Result<(), ServoError> {
        self.call_done(Request::WritePosition { id, position }).await
    }

    pub async fn set_torque(&self, id: u8, enable: bool) -> Result<(), ServoError> {
        self.call_done(Request::SetTorque { id, enable }).await
    }

    pub async fn read_mode(&self, id: u8) -> Result<ServoMode, ServoError> {
        match self.call(Request::ReadMode { id }).await? {
            Reply::Mode(mode) => Ok(mode),
            _ => Err(unexpected(Some(id), "read_mode")),
        }
    }

    pub async fn write_mode(&self, id: u8, mode: ServoMode) -> Result<(), ServoError> {
        self.call_done(Request::WriteMode { id, mode }).await
    }

    pub async fn set_acceleration(&self, id: u8, acceleration: u8) -> Result<(), ServoError> {
        self.call_done(Request::SetAcceleration { id, acceleration })
            .await
    }

    pub async fn write_wheel_speed(&self, id: u8, speed: i16) -> Result<(), ServoError> {
        self.call_done(Request::WriteWheelSpeed { id, speed }).await
    }

    pub async fn set_servo_id(&self, id: u8, new_id: u8) -> Result<(), ServoError> {
        self.call_done(Request::SetServoId { id, new_id }).await
    }

    pub async fn set_baud_code(&self, id: u8, code: u8) -> Result<(), ServoError> {
        self.call_done(Request::SetBaudCode { id, code }).await
    }

    /* ---- batch ---- */
    pub async fn sync_read_positions(&self, ids: &[u8]) -> Result<ServoMap<u16>, ServoError> {
        let op = "sync_read_positions";
        let ids = ServoIds::from_slice(ids)
            .map_err(|_| ServoError::new(None, op, ErrorKind::InvalidArgument))?;
        match self.call(Request::SyncReadPositions { ids }).await? {
            Reply::Positions(map) => Ok(map),
            _ => Err(unexpected(None, op)),
        }
    }

    pub async fn sync_write_positions(&self, targets: ServoMap<u16>) -> Result<(), ServoError> {
        self.call_done(Request::SyncWritePositions { targets }).await
    }

    pub async fn sync_write_speeds(&self, targets: ServoMap<i16>) -> Result<(), ServoError> {
        self.call_done(Request::SyncWriteSpeeds { targets }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::servo::codec::{decode_status, encode_status, Frame};
    use crate::drivers::servo::error::CommError;
    use crate::drivers::servo::mock::MockTransport;
    use crate::drivers::servo::protocol as p;
    use embassy_futures::block_on;
    use embassy_futures::join::{join, join3};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Hub = ServoHub<NoopRawMutex, MockTransport>;

    fn ack(id: u8) -> Frame {
        encode_status(id, 0, &[]).unwrap()
    }

    fn connected(setup: impl FnOnce(&mut MockTransport)) -> Hub {
        let mut mock = MockTransport::new();
        setup(&mut mock);
        let hub = Hub::new(mock);
        block_on(hub.run_until(hub.connect(1_000_000, ByteOrder::LittleEndian))).unwrap();
        assert_eq!(hub.link_state(), LinkState::Connected);
        hub
    }

    fn sent_ids(hub: &Hub) -> std::vec::Vec<u8> {
        hub.servo()
            .bus()
            .with_transport(|m| m.written().iter().map(|f| decode_status(f).unwrap().id).collect())
            .unwrap()
    }

    #[test]
    fn concurrent_callers_run_in_fifo_order() {
        let hub = connected(|m| {
            m.queue_reply(&ack(1));
            m.queue_reply(&encode_status(2, 0, &[0xE8, 0x03]).unwrap());
            m.queue_reply(&ack(3));
        });
        let (a, b, c) = block_on(hub.run_until(join3(
            hub.write_position(1, 100),
            hub.read_position(2),
            hub.set_torque(3, true),
        )));
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(1000));
        assert_eq!(c, Ok(()));
        assert_eq!(sent_ids(&hub), [1, 2, 3]);
    }

    #[test]
    fn failure_does_not_abort_queued_operations() {
        let hub = connected(|m| {
            m.queue_silence();
            m.queue_reply(&ack(2));
        });
        let (a, b) = block_on(hub.run_until(join(hub.set_torque(1, true), hub.set_torque(2, true))));
        assert_eq!(a.unwrap_err().comm(), Some(CommError::RxTimeout));
        assert_eq!(b, Ok(()));
    }

    #[test]
    fn operations_before_connect_fail_fast() {
        let hub = Hub::new(MockTransport::new());
        let err = block_on(hub.run_until(hub.write_position(1, 100))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
        assert_eq!(err.id, Some(1));
        assert!(sent_ids(&hub).is_empty());
    }

    #[test]
    fn second_connect_is_rejected() {
        let hub = connected(|_| {});
        let err = block_on(hub.run_until(hub.connect(1_000_000, ByteOrder::LittleEndian))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyConnected);
        assert_eq!(hub.link_state(), LinkState::Connected);
    }

    #[test]
    fn refused_open_returns_to_disconnected() {
        let mut mock = MockTransport::new();
        mock.set_refuse_open(true);
        let hub = Hub::new(mock);
        let err = block_on(hub.run_until(hub.connect_with(LinkConfig::default()))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OpenFailed);
        assert_eq!(hub.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn disconnect_is_idempotent_and_releases_transport() {
        let hub = connected(|_| {});
        block_on(hub.run_until(hub.disconnect())).unwrap();
        assert_eq!(hub.link_state(), LinkState::Disconnected);
        block_on(hub.run_until(hub.disconnect())).unwrap();
        hub.servo()
            .bus()
            .with_transport(|m| assert_eq!(m.baud_rate(), None))
            .unwrap();
    }

    #[test]
    fn requests_queued_behind_disconnect_see_not_connected() {
        let hub = connected(|_| {});
        let (d, w) = block_on(hub.run_until(join(hub.disconnect(), hub.write_position(1, 10))));
        assert_eq!(d, Ok(()));
        assert_eq!(w.unwrap_err().kind, ErrorKind::NotConnected);
        assert!(sent_ids(&hub).is_empty());
    }

    #[test]
    fn mode_write_relocks_after_failed_write() {
        let hub = connected(|m| {
            m.queue_reply(&ack(4));
            m.queue_silence();
            m.queue_reply(&ack(4));
        });
        let err = block_on(hub.run_until(hub.write_mode(4, ServoMode::Wheel))).unwrap_err();
        assert_eq!(err.id, Some(4));
        hub.servo()
            .bus()
            .with_transport(|m| {
                let last = decode_status(m.written().last().unwrap()).unwrap();
                assert_eq!(last.params.as_slice(), &[p::REG_LOCK, p::LOCK_ON]);
            })
            .unwrap();
    }

    #[test]
    fn batch_positions_round_trip_through_queue() {
        let hub = connected(|m| {
            // the sync write gets no answer
            m.queue_silence();
            let mut bytes = std::vec::Vec::new();
            bytes.extend_from_slice(&encode_status(1, 0, &[0x00, 0x08]).unwrap());
            bytes.extend_from_slice(&encode_status(2, 0, &[0xFF, 0x0F]).unwrap());
            m.queue_reply(&bytes);
        });
        let mut targets = ServoMap::new();
        targets.insert(1, 2048).unwrap();
        targets.insert(2, 4095).unwrap();
        block_on(hub.run_until(hub.sync_write_positions(targets))).unwrap();
        let read = block_on(hub.run_until(hub.sync_read_positions(&[1, 2]))).unwrap();
        assert_eq!(read.get(&1), Some(&2048));
        assert_eq!(read.get(&2), Some(&4095));
    }

    #[test]
    fn abandoned_callers_give_their_slots_back() {
        let rounds = COMMAND_QUEUE_DEPTH * 2;
        let hub = connected(|m| {
            for _ in 0..=rounds {
                m.queue_reply(&ack(1));
            }
        });
        block_on(hub.run_until(async {
            for _ in 0..rounds {
                // the caller gives up right after queueing
                let _ = select(hub.set_torque(1, true), core::future::ready(())).await;
                embassy_futures::yield_now().await;
            }
            assert_eq!(hub.set_torque(1, false).await, Ok(()));
        }));
        assert_eq!(hub.free.len(), COMMAND_QUEUE_DEPTH);
        assert_eq!(hub.abandoned.lock(|a| a.get()), 0);
    }

    #[test]
    fn reply_slots_are_recycled() {
        let hub = connected(|m| {
            for _ in 0..COMMAND_QUEUE_DEPTH * 3 {
                m.queue_reply(&ack(1));
            }
        });
        for _ in 0..COMMAND_QUEUE_DEPTH * 3 {
            block_on(hub.run_until(hub.set_torque(1, false))).unwrap();
        }
    }
}
