//! Per-connection framing: a line-extracting receive buffer and a
//! flow-controlled FIFO send queue.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;

use log::warn;
use mio::{Interest, Token};

use crate::codec::{self, MAX_LINE_LEN};
use crate::poll::PollRegistry;
use crate::stream::{ByteStream, IoOutcome};

const RECV_SLACK: usize = MAX_LINE_LEN;

pub struct Connection {
    pub id: u64,
    pub token: Token,
    pub connected: bool,
    stream: ByteStream,
    recv_buf: Vec<u8>,
    filled: usize,
    send_queue: VecDeque<String>,
    send_cursor: usize,
    write_interested: bool,
    max_send_queue: usize,
}

impl Connection {
    pub fn new(id: u64, token: Token, stream: ByteStream, max_send_queue: usize) -> Self {
        Self {
            id,
            token,
            connected: true,
            stream,
            recv_buf: Vec::new(),
            filled: 0,
            send_queue: VecDeque::new(),
            send_cursor: 0,
            write_interested: false,
            max_send_queue,
        }
    }

    pub fn register(&mut self, poll: &PollRegistry) -> io::Result<()> {
        poll.register(self.stream.inner_mut(), self.token, Interest::READABLE)
    }

    pub fn peer_ipv4(&self) -> io::Result<Ipv4Addr> {
        self.stream.peer_ipv4()
    }

    fn ensure_slack(&mut self) {
        let needed = self.filled + RECV_SLACK;
        if self.recv_buf.len() < needed {
            self.recv_buf.resize(needed, 0);
        }
    }

    /// Drains the socket and returns every complete line extracted.
    pub fn poll_recv(&mut self) -> io::Result<Vec<String>> {
        loop {
            self.ensure_slack();
            let end = self.filled + RECV_SLACK;
            match self.stream.recv(&mut self.recv_buf[self.filled..end])? {
                IoOutcome::Moved(n) => {
                    self.filled += n;
                    if n < RECV_SLACK {
                        break;
                    }
                }
                IoOutcome::WouldBlock => break,
                IoOutcome::Closed => {
                    self.connected = false;
                    break;
                }
            }
        }
        Ok(self.extract_lines())
    }

    /// Extracts and compacts every complete `\n`-terminated line currently
    /// buffered, in order.
    fn extract_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.recv_buf[..self.filled].iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = String::from_utf8_lossy(&self.recv_buf[..=pos]).into_owned();
            self.recv_buf.drain(0..=pos);
            self.filled -= pos + 1;
            lines.push(line);
        }
        lines
    }

    /// Splits `msg` into `MAX_LINE_LEN` chunks and enqueues them. Registers
    /// writable interest if it was not already registered. If the queue
    /// would exceed its configured bound, the oldest unsent chunk is
    /// dropped and a warning logged (the connection is not disconnected
    /// for this alone).
    pub fn send_message(&mut self, msg: &str, poll: &PollRegistry) -> io::Result<()> {
        for chunk in codec::chunk_message(msg) {
            if self.send_queue.len() >= self.max_send_queue {
                self.send_queue.pop_front();
                self.send_cursor = 0;
                warn!(
                    "connection {} send queue overflowed ({} chunks), dropping oldest",
                    self.id, self.max_send_queue
                );
            }
            self.send_queue.push_back(chunk);
        }
        if !self.write_interested && !self.send_queue.is_empty() {
            poll.reregister(
                self.stream.inner_mut(),
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            self.write_interested = true;
        }
        Ok(())
    }

    /// Drains as much of the send queue as the socket accepts without
    /// blocking.
    pub fn poll_send(&mut self, poll: &PollRegistry) -> io::Result<()> {
        while let Some(head) = self.send_queue.front() {
            let bytes = head.as_bytes();
            match self.stream.send(&bytes[self.send_cursor..])? {
                IoOutcome::Moved(n) => {
                    self.send_cursor += n;
                    if self.send_cursor >= bytes.len() {
                        self.send_queue.pop_front();
                        self.send_cursor = 0;
                    }
                }
                IoOutcome::WouldBlock => return Ok(()),
                IoOutcome::Closed => {
                    self.connected = false;
                    return Ok(());
                }
            }
        }
        if self.write_interested {
            poll.reregister(self.stream.inner_mut(), self.token, Interest::READABLE)?;
            self.write_interested = false;
        }
        Ok(())
    }

    pub fn disconnect(&mut self, poll: &PollRegistry) {
        self.connected = false;
        let _ = poll.deregister(self.stream.inner_mut());
        self.stream.close();
    }
}

#[cfg(test)]
impl Connection {
    /// Snapshot of pending outbound chunks, bypassing socket IO entirely.
    pub(crate) fn queued_messages(&self) -> Vec<String> {
        self.send_queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_slack_grows_with_filled() {
        let mut buf = Vec::new();
        let filled = 10usize;
        let needed = filled + RECV_SLACK;
        buf.resize(needed, 0);
        assert_eq!(buf.len(), filled + MAX_LINE_LEN);
    }
}
