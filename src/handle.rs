//! The non-blocking read/write state machine shared by every transport.
//!
//! A [`Handle`] owns the interest flags, the pending-write queue and the
//! close flags. It performs at most one I/O operation per readiness event
//! and reports what happened; the owning transport decides what that means
//! for its protocol.
//!
//! ```text
//!  write() ──▶ queue ──arm write──▶ do_write ──▶ strategy.write_some ──▶ fd
//!                                     │
//!                       queue empty & disconnecting
//!                                     ▼
//!                             strategy.shutdown ──▶ Closed(Done)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::error::CloseReason;
use crate::reactor::{Reactor, Selectable, call_soon};

/// Which readiness an operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
	Read,
	Write,
}

/// Result of one non-blocking operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
	/// `n` bytes moved. For reads, `Complete(0)` is end of stream.
	Complete(usize),
	/// Nothing moved; retry once the named readiness arrives.
	WouldBlock(Interest),
	/// The handle is finished.
	Fatal(CloseReason),
}

impl IoOutcome {
	pub(crate) fn from_read(result: io::Result<usize>) -> Self {
		match result {
			Ok(n) => IoOutcome::Complete(n),
			Err(e) if is_retry(&e) => IoOutcome::WouldBlock(Interest::Read),
			Err(e) => IoOutcome::Fatal(CloseReason::from_io(&e)),
		}
	}

	pub(crate) fn from_write(result: io::Result<usize>) -> Self {
		match result {
			Ok(n) => IoOutcome::Complete(n),
			Err(e) if is_retry(&e) => IoOutcome::WouldBlock(Interest::Write),
			Err(e) => IoOutcome::Fatal(CloseReason::from_io(&e)),
		}
	}
}

fn is_retry(err: &io::Error) -> bool {
	matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// A byte pipe the strategies drive: a connected socket or a pipe end.
pub trait RawIo: io::Read + io::Write {
	/// Half-close: no more bytes will be written.
	fn shutdown_write(&mut self) -> io::Result<()>;
}

/// How bytes cross the handle: in the clear, or through a security layer.
///
/// Swapping the strategy is how a connection upgrades to TLS without the
/// protocol noticing.
pub trait IoStrategy {
	fn read_some(&mut self, io: &mut dyn RawIo, buf: &mut [u8]) -> IoOutcome;

	fn write_some(&mut self, io: &mut dyn RawIo, data: &[u8]) -> IoOutcome;

	/// Bytes accepted by `write_some` that have not reached the descriptor.
	fn has_buffered_output(&self) -> bool {
		false
	}

	/// Pushes buffered output towards the descriptor.
	fn flush(&mut self, _io: &mut dyn RawIo) -> IoOutcome {
		IoOutcome::Complete(0)
	}

	/// Decoded bytes waiting to be read without touching the descriptor.
	fn has_buffered_input(&self) -> bool {
		false
	}

	/// The strategy needs read readiness regardless of the protocol
	/// (e.g. a handshake in flight).
	fn wants_read(&self) -> bool {
		false
	}

	/// Ends the output stream cleanly. Called once the queue is empty and
	/// may be called again while it reports `WouldBlock`.
	fn shutdown(&mut self, _io: &mut dyn RawIo) -> IoOutcome {
		IoOutcome::Complete(0)
	}

	fn name(&self) -> &'static str;
}

/// Plain reads and writes.
#[derive(Debug, Default)]
pub struct PlainIo;

impl IoStrategy for PlainIo {
	fn read_some(&mut self, io: &mut dyn RawIo, buf: &mut [u8]) -> IoOutcome {
		IoOutcome::from_read(io.read(buf))
	}

	fn write_some(&mut self, io: &mut dyn RawIo, data: &[u8]) -> IoOutcome {
		IoOutcome::from_write(io.write(data))
	}

	fn name(&self) -> &'static str {
		"plain"
	}
}

/// Ordered pending output. Chunks are never split or merged, only
/// consumed from the front.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
	chunks: VecDeque<Vec<u8>>,
	offset: usize,
	len: usize,
}

impl WriteQueue {
	pub(crate) fn push(&mut self, data: &[u8]) {
		if data.is_empty() {
			return;
		}
		self.len += data.len();
		self.chunks.push_back(data.to_vec());
	}

	/// Unsent part of the oldest chunk.
	pub(crate) fn front(&self) -> Option<&[u8]> {
		self.chunks.front().map(|chunk| &chunk[self.offset..])
	}

	pub(crate) fn consume(&mut self, mut n: usize) {
		n = n.min(self.len);
		self.len -= n;
		while n > 0 {
			let Some(chunk) = self.chunks.front() else { break };
			let remaining = chunk.len() - self.offset;
			if n < remaining {
				self.offset += n;
				return;
			}
			n -= remaining;
			self.offset = 0;
			self.chunks.pop_front();
		}
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub(crate) fn len(&self) -> usize {
		self.len
	}

	pub(crate) fn clear(&mut self) {
		self.chunks.clear();
		self.offset = 0;
		self.len = 0;
	}

	pub(crate) fn drain_chunks(&mut self) -> Vec<Vec<u8>> {
		if self.offset > 0 {
			if let Some(front) = self.chunks.front_mut() {
				front.drain(..self.offset);
			}
		}
		self.offset = 0;
		self.len = 0;
		self.chunks.drain(..).collect()
	}
}

/// What a write-readiness event achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteProgress {
	/// More to do on a later event.
	Pending,
	/// Queue drained; nothing left to send.
	Idle,
	/// Queue drained and the write half was shut down.
	WriteClosed,
	/// The handle is finished.
	Closed(CloseReason),
}

/// What a read-readiness event achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadProgress {
	Data(usize),
	Nothing,
	Eof,
	Closed(CloseReason),
}

/// Interest and close bookkeeping for one descriptor.
pub struct Handle {
	reactor: Rc<dyn Reactor>,
	owner: Weak<dyn Selectable>,
	fd: Cell<RawFd>,

	connected: Cell<bool>,
	disconnecting: Cell<bool>,
	disconnected: Cell<bool>,
	reading: Cell<bool>,
	writing: Cell<bool>,
	read_closed: Cell<bool>,
	write_disconnecting: Cell<bool>,
	write_disconnected: Cell<bool>,
	teardown_scheduled: Cell<bool>,

	read_blocked_on_write: Cell<bool>,
	write_blocked_on_read: Cell<bool>,

	queue: RefCell<WriteQueue>,
}

impl Handle {
	/// `owner` is the transport the reactor calls back into; it is usually
	/// the `Weak` handed out by `Rc::new_cyclic`.
	pub(crate) fn new(reactor: Rc<dyn Reactor>, fd: RawFd, owner: Weak<dyn Selectable>) -> Self {
		Self {
			reactor,
			owner,
			fd: Cell::new(fd),
			connected: Cell::new(false),
			disconnecting: Cell::new(false),
			disconnected: Cell::new(false),
			reading: Cell::new(false),
			writing: Cell::new(false),
			read_closed: Cell::new(false),
			write_disconnecting: Cell::new(false),
			write_disconnected: Cell::new(false),
			teardown_scheduled: Cell::new(false),
			read_blocked_on_write: Cell::new(false),
			write_blocked_on_read: Cell::new(false),
			queue: RefCell::new(WriteQueue::default()),
		}
	}

	pub fn reactor(&self) -> &Rc<dyn Reactor> {
		&self.reactor
	}

	pub fn fileno(&self) -> RawFd {
		self.fd.get()
	}

	pub fn is_connected(&self) -> bool {
		self.connected.get()
	}

	pub fn is_disconnecting(&self) -> bool {
		self.disconnecting.get()
	}

	pub fn is_disconnected(&self) -> bool {
		self.disconnected.get()
	}

	pub fn is_reading(&self) -> bool {
		self.reading.get()
	}

	pub fn is_writing(&self) -> bool {
		self.writing.get()
	}

	pub(crate) fn is_read_closed(&self) -> bool {
		self.read_closed.get()
	}

	pub(crate) fn is_write_disconnected(&self) -> bool {
		self.write_disconnected.get()
	}

	/// Adopts a descriptor created after the handle.
	pub(crate) fn attach(&self, fd: RawFd) {
		self.fd.set(fd);
	}

	pub(crate) fn set_connected(&self) {
		self.connected.set(true);
	}

	pub(crate) fn queued_len(&self) -> usize {
		self.queue.borrow().len()
	}

	pub(crate) fn queue_is_empty(&self) -> bool {
		self.queue.borrow().is_empty()
	}

	pub fn start_reading(&self) {
		if self.reading.get() || self.disconnected.get() || self.read_closed.get() {
			return;
		}
		if let Some(owner) = self.owner.upgrade() {
			self.reading.set(true);
			self.reactor.add_reader(owner);
		}
	}

	pub fn stop_reading(&self) {
		if self.reading.replace(false) {
			self.reactor.remove_reader(self.fd.get());
		}
	}

	pub fn start_writing(&self) {
		if self.writing.get() || self.disconnected.get() {
			return;
		}
		if let Some(owner) = self.owner.upgrade() {
			self.writing.set(true);
			self.reactor.add_writer(owner);
		}
	}

	pub fn stop_writing(&self) {
		if self.writing.replace(false) {
			self.reactor.remove_writer(self.fd.get());
		}
	}

	/// Appends to the queue and arms write readiness. Ignored when not
	/// connected or once any kind of close has been requested.
	pub(crate) fn write(&self, data: &[u8]) {
		if data.is_empty() || !self.accepts_writes() {
			return;
		}
		self.queue.borrow_mut().push(data);
		self.start_writing();
	}

	pub(crate) fn accepts_writes(&self) -> bool {
		self.connected.get()
			&& !self.disconnecting.get()
			&& !self.write_disconnecting.get()
			&& !self.write_disconnected.get()
	}

	/// Graceful close: no new writes, flush, then close from `do_write`.
	pub(crate) fn lose_connection(&self) {
		if !self.connected.get() || self.disconnecting.get() {
			return;
		}
		self.disconnecting.set(true);
		self.stop_reading();
		self.start_writing();
	}

	/// Flush, then shut down the write half only.
	pub(crate) fn lose_write_connection(&self) {
		if !self.connected.get() || self.disconnecting.get() || self.write_disconnecting.get() {
			return;
		}
		self.write_disconnecting.set(true);
		self.start_writing();
	}

	/// Drops pending output and schedules teardown with `Aborted`.
	pub(crate) fn abort(&self) {
		if self.disconnected.get() {
			return;
		}
		self.queue.borrow_mut().clear();
		self.stop_reading();
		self.stop_writing();
		self.disconnecting.set(true);
		self.schedule_teardown(CloseReason::Aborted);
	}

	/// Delivers `reason` to the owner's `connection_lost` on the next turn,
	/// once.
	pub(crate) fn schedule_teardown(&self, reason: CloseReason) {
		if self.teardown_scheduled.replace(true) || self.disconnected.get() {
			return;
		}
		let owner = self.owner.clone();
		call_soon(&self.reactor, move || {
			if let Some(owner) = owner.upgrade() {
				owner.connection_lost(reason);
			}
		});
	}

	/// Unregisters and marks the handle dead. Returns `false` if that had
	/// already happened. The caller closes the descriptor afterwards.
	pub(crate) fn mark_closed(&self) -> bool {
		if self.disconnected.replace(true) {
			return false;
		}
		self.stop_reading();
		self.stop_writing();
		self.connected.set(false);
		self.queue.borrow_mut().clear();
		self.fd.set(-1);
		true
	}

	/// The peer closed its write half; stop watching for reads.
	pub(crate) fn mark_read_closed(&self) {
		self.stop_reading();
		self.read_closed.set(true);
	}

	/// Runs one read through `strategy`.
	pub(crate) fn read(&self, strategy: &mut dyn IoStrategy, io: &mut dyn RawIo, buf: &mut [u8]) -> ReadProgress {
		if self.write_blocked_on_read.replace(false) {
			self.start_writing();
		}
		let progress = match strategy.read_some(io, buf) {
			IoOutcome::Complete(0) => ReadProgress::Eof,
			IoOutcome::Complete(n) => ReadProgress::Data(n),
			IoOutcome::WouldBlock(Interest::Read) => ReadProgress::Nothing,
			IoOutcome::WouldBlock(Interest::Write) => {
				self.read_blocked_on_write.set(true);
				self.start_writing();
				ReadProgress::Nothing
			}
			IoOutcome::Fatal(reason) => ReadProgress::Closed(reason),
		};
		if strategy.has_buffered_output() {
			self.start_writing();
		}
		progress
	}

	/// Runs one write-readiness step through `strategy`.
	pub(crate) fn flush(&self, strategy: &mut dyn IoStrategy, io: &mut dyn RawIo) -> WriteProgress {
		if self.read_blocked_on_write.replace(false) && !self.disconnecting.get() {
			self.start_reading();
		}

		if strategy.has_buffered_output() {
			match strategy.flush(io) {
				IoOutcome::Complete(_) => {}
				IoOutcome::WouldBlock(interest) => return self.blocked(interest),
				IoOutcome::Fatal(reason) => return WriteProgress::Closed(reason),
			}
			if strategy.has_buffered_output() {
				return WriteProgress::Pending;
			}
		}

		let outcome = {
			let queue = self.queue.borrow();
			queue.front().map(|chunk| strategy.write_some(io, chunk))
		};
		match outcome {
			Some(IoOutcome::Complete(n)) => {
				self.queue.borrow_mut().consume(n);
				if !self.queue_is_empty() || strategy.has_buffered_output() {
					return WriteProgress::Pending;
				}
			}
			Some(IoOutcome::WouldBlock(interest)) => return self.blocked(interest),
			Some(IoOutcome::Fatal(reason)) => return WriteProgress::Closed(reason),
			None => {}
		}

		if self.disconnecting.get() {
			return match strategy.shutdown(io) {
				IoOutcome::Complete(_) => {
					self.stop_writing();
					WriteProgress::Closed(CloseReason::Done)
				}
				IoOutcome::WouldBlock(interest) => self.blocked(interest),
				IoOutcome::Fatal(reason) => WriteProgress::Closed(reason),
			};
		}

		self.stop_writing();

		if self.write_disconnecting.get() && !self.write_disconnected.get() {
			self.write_disconnected.set(true);
			if let Err(e) = io.shutdown_write() {
				return WriteProgress::Closed(CloseReason::from_io(&e));
			}
			return WriteProgress::WriteClosed;
		}

		WriteProgress::Idle
	}

	fn blocked(&self, interest: Interest) -> WriteProgress {
		if interest == Interest::Read {
			self.write_blocked_on_read.set(true);
			self.stop_writing();
			self.start_reading_forced();
		}
		WriteProgress::Pending
	}

	/// Arms reads even while disconnecting; used when a write needs the
	/// peer to talk first.
	fn start_reading_forced(&self) {
		if self.reading.get() || self.disconnected.get() {
			return;
		}
		if let Some(owner) = self.owner.upgrade() {
			self.reading.set(true);
			self.reactor.add_reader(owner);
		}
	}

	/// Re-arms whatever `strategy` needs on its own account.
	pub(crate) fn sync_strategy_interest(&self, strategy: &dyn IoStrategy) {
		if strategy.has_buffered_output() {
			self.start_writing();
		}
		if strategy.wants_read() {
			self.start_reading_forced();
		}
	}
}
