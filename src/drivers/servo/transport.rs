//! Byte transport contract consumed by the bus, plus a UART adapter.

use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::{Read, Write};

use crate::config::{FLUSH_IDLE_US, FLUSH_WINDOW_MS};

/// An exclusive, half-duplex byte channel (serial port, USB bridge, ...).
///
/// `read` must return within roughly `timeout` even when nothing arrives, and
/// may return fewer bytes than `buf` holds. `write` reports how many bytes
/// actually left; anything short of the full frame is a transmit failure.
pub trait Transport {
    async fn open(&mut self, baud_rate: u32) -> bool;
    async fn write(&mut self, bytes: &[u8]) -> usize;
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize;
    /// Discard unread input so a late reply is never credited to the next transaction.
    async fn flush_input(&mut self);
    async fn close(&mut self);
}

/// [`Transport`] over split async UART halves.
///
/// The baud rate belongs to the peripheral configuration, so `open` only
/// accepts the rate the halves were built with.
pub struct UartTransport<Tx, Rx> {
    tx: Tx,
    rx: Rx,
    baud_rate: u32,
    open: bool,
}

impl<Tx: Write, Rx: Read> UartTransport<Tx, Rx> {
    pub fn new(tx: Tx, rx: Rx, baud_rate: u32) -> Self {
        Self {
            tx,
            rx,
            baud_rate,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn release(self) -> (Tx, Rx) {
        (self.tx, self.rx)
    }
}

impl<Tx: Write, Rx: Read> Transport for UartTransport<Tx, Rx> {
    async fn open(&mut self, baud_rate: u32) -> bool {
        if baud_rate != self.baud_rate {
            warn!(
                "uart runs at {} baud, refusing open at {}",
                self.baud_rate, baud_rate
            );
            return false;
        }
        self.open = true;
        true
    }

    async fn write(&mut self, bytes: &[u8]) -> usize {
        if !self.open {
            return 0;
        }
        let mut sent = 0;
        while sent < bytes.len() {
            match self.tx.write(&bytes[sent..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sent += n,
            }
        }
        if self.tx.flush().await.is_err() {
            warn!("uart flush failed after {} bytes", sent);
        }
        sent
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        if !self.open || buf.is_empty() {
            return 0;
        }
        match with_timeout(timeout, self.rx.read(buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => {
                warn!("uart read error");
                0
            }
            Err(_) => 0,
        }
    }

    async fn flush_input(&mut self) {
        let mut trash = [0u8; 128];
        let start = Instant::now();
        let window = Duration::from_millis(FLUSH_WINDOW_MS);

        while start.elapsed() < window {
            match with_timeout(Duration::from_micros(FLUSH_IDLE_US), self.rx.read(&mut trash)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => break, // idle or error: nothing more to drop
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.tx.flush().await;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use std::vec::Vec;

    struct Sink(Vec<u8>, usize);

    impl embedded_io_async::ErrorType for Sink {
        type Error = Infallible;
    }

    impl Write for Sink {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
            // accept at most `self.1` bytes per call
            let n = buf.len().min(self.1);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[test]
    fn uart_write_loops_over_short_writes() {
        block_on(async {
            let rx: &[u8] = &[];
            let mut uart = UartTransport::new(Sink(Vec::new(), 3), rx, 1_000_000);
            assert_eq!(uart.write(&[1, 2, 3, 4, 5]).await, 0, "closed port sends nothing");
            assert!(!uart.open(115_200).await);
            assert!(uart.open(1_000_000).await);
            assert_eq!(uart.write(&[1, 2, 3, 4, 5, 6, 7]).await, 7);
            let (tx, _) = uart.release();
            assert_eq!(tx.0, [1, 2, 3, 4, 5, 6, 7]);
        });
    }

    #[test]
    fn uart_read_and_flush_use_rx_half() {
        block_on(async {
            let rx: &[u8] = &[9, 8, 7];
            let mut uart = UartTransport::new(Sink(Vec::new(), 64), rx, 1_000_000);
            assert!(uart.open(1_000_000).await);
            let mut buf = [0u8; 2];
            assert_eq!(uart.read(&mut buf, Duration::from_millis(1)).await, 2);
            assert_eq!(buf, [9, 8]);
            uart.flush_input().await;
            assert_eq!(uart.read(&mut buf, Duration::from_millis(1)).await, 0);
        });
    }
}
