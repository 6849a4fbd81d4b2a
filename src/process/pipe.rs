use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use super::Process;
use crate::error::CloseReason;
use crate::handle::{Handle, PlainIo, RawIo, ReadProgress, WriteProgress};
use crate::reactor::{Reactor, Selectable};

/// One end of a pipe as a byte stream.
pub(crate) struct PipeFd(OwnedFd);

impl io::Read for PipeFd {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let n = unsafe { libc::read(self.0.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}
}

impl io::Write for PipeFd {
	// SIGPIPE is ignored by the Rust runtime, so a closed reader shows up
	// as EPIPE here.
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe { libc::write(self.0.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len()) };
		if n == -1 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl RawIo for PipeFd {
	fn shutdown_write(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// The parent's end of one child descriptor.
///
/// Holds its process strongly until it closes, so a running child stays
/// reachable from the reactor even if the caller dropped it.
pub(crate) struct Pipe {
	handle: Handle,
	child_fd: RawFd,
	/// The parent writes; the child reads.
	to_child: bool,
	fd: RefCell<Option<PipeFd>>,
	process: RefCell<Option<Rc<Process>>>,
	read_buf: RefCell<Vec<u8>>,
}

impl Pipe {
	pub(crate) fn new(
		reactor: Rc<dyn Reactor>,
		child_fd: RawFd,
		to_child: bool,
		fd: OwnedFd,
		process: Rc<Process>,
	) -> Rc<Self> {
		let raw = fd.as_raw_fd();
		let read_size = if to_child { 0 } else { 8192 };
		Rc::new_cyclic(|this: &Weak<Self>| {
			let owner: Weak<dyn Selectable> = this.clone();
			Self {
				handle: Handle::new(reactor, raw, owner),
				child_fd,
				to_child,
				fd: RefCell::new(Some(PipeFd(fd))),
				process: RefCell::new(Some(process)),
				read_buf: RefCell::new(vec![0; read_size]),
			}
		})
	}

	/// Starts watching the pipe. Pipes towards the child are watched for
	/// reads too: readiness there means the child closed its end.
	pub(crate) fn start(&self) {
		self.handle.set_connected();
		self.handle.start_reading();
	}

	pub(crate) fn write(&self, data: &[u8]) {
		self.handle.write(data);
	}

	pub(crate) fn pending_bytes(&self) -> usize {
		self.handle.queued_len()
	}

	pub(crate) fn child_fd(&self) -> RawFd {
		self.child_fd
	}

	pub(crate) fn is_to_child(&self) -> bool {
		self.to_child
	}

	/// Flushes queued input first (pipes towards the child), then closes.
	pub(crate) fn lose_connection(&self) {
		if self.to_child {
			self.handle.lose_connection();
		} else {
			self.handle.stop_reading();
			self.handle.schedule_teardown(CloseReason::Done);
		}
	}

	fn close(&self, reason: CloseReason) {
		if !self.handle.mark_closed() {
			return;
		}
		drop(self.fd.borrow_mut().take());
		if let Some(process) = self.process.borrow_mut().take() {
			process.pipe_lost(self.child_fd, reason);
		}
	}

	fn process(&self) -> Option<Rc<Process>> {
		self.process.borrow().clone()
	}
}

impl Selectable for Pipe {
	fn fileno(&self) -> RawFd {
		self.handle.fileno()
	}

	fn do_read(&self) {
		if self.to_child {
			self.close(CloseReason::Lost { errno: Some(libc::EPIPE) });
			return;
		}
		let mut buf = std::mem::take(&mut *self.read_buf.borrow_mut());
		let progress = match self.fd.borrow_mut().as_mut() {
			Some(fd) => self.handle.read(&mut PlainIo, fd, &mut buf),
			None => ReadProgress::Nothing,
		};
		match progress {
			ReadProgress::Data(n) => {
				if let Some(process) = self.process() {
					process.child_output(self.child_fd, &buf[..n]);
				}
			}
			ReadProgress::Nothing => {}
			ReadProgress::Eof => self.close(CloseReason::Done),
			ReadProgress::Closed(reason) => self.close(reason),
		}
		*self.read_buf.borrow_mut() = buf;
	}

	fn do_write(&self) {
		let progress = match self.fd.borrow_mut().as_mut() {
			Some(fd) => self.handle.flush(&mut PlainIo, fd),
			None => return,
		};
		match progress {
			WriteProgress::Pending | WriteProgress::Idle => {}
			WriteProgress::WriteClosed => self.close(CloseReason::Done),
			WriteProgress::Closed(reason) => self.close(reason),
		}
	}

	fn connection_lost(&self, reason: CloseReason) {
		self.close(reason);
	}

	fn log_prefix(&self) -> String {
		format!("child fd {}", self.child_fd)
	}
}
