//! Background serial log listener
//!
//! Keeps a live console on the port while nothing is being flashed: one
//! reader thread decodes incoming bytes into lines and pushes them to a
//! bounded channel (dropping lines rather than blocking on a slow consumer),
//! one writer thread drains an outgoing queue. Closing joins both.

use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, warn};
use serialport::SerialPort;

use crate::error::Error;

const LINE_CHANNEL_DEPTH: usize = 256;
const WRITE_CHANNEL_DEPTH: usize = 64;
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A running listener on one port.
pub struct Listener {
    lines: Receiver<String>,
    writes: Option<SyncSender<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Listener {
    /// Take over `port` with a reader and a writer thread.
    pub fn start(port: Box<dyn SerialPort>) -> Result<Self, Error> {
        let mut reader_port = port;
        reader_port.set_timeout(POLL_TIMEOUT)?;
        let writer_port = reader_port.try_clone()?;

        let stop = Arc::new(AtomicBool::new(false));
        let (line_tx, line_rx) = sync_channel(LINE_CHANNEL_DEPTH);
        let (write_tx, write_rx) = sync_channel::<Vec<u8>>(WRITE_CHANNEL_DEPTH);

        let reader_stop = Arc::clone(&stop);
        let reader = thread::spawn(move || read_loop(reader_port, line_tx, reader_stop));

        let writer = thread::spawn(move || write_loop(writer_port, write_rx));

        Ok(Self {
            lines: line_rx,
            writes: Some(write_tx),
            stop,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Decoded lines from the device, in arrival order.
    pub fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    /// Queue bytes for transmission. Fails once the listener is closing.
    pub fn write(&self, data: Vec<u8>) -> Result<(), Error> {
        if let Some(writes) = &self.writes {
            if writes.send(data).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Connection(
            crate::error::ConnectionError::ConnectionFailed,
        ))
    }

    /// Stop both threads and wait for them.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // dropping the sender ends the writer's recv loop
        self.writes.take();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, lines: SyncSender<String>, stop: Arc<AtomicBool>) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 512];

    while !stop.load(Ordering::Relaxed) {
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                debug!("Listener read error, stopping: {e}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            match lines.try_send(line) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn write_loop(mut port: Box<dyn SerialPort>, writes: Receiver<Vec<u8>>) {
    // ends when the listener drops its sender
    while let Ok(data) = writes.recv() {
        if let Err(e) = port.write_all(&data) {
            warn!("Listener write failed: {e}");
            break;
        }
        let _ = port.flush();
    }
}
