mod support;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use reactorlane::{
	ChildFd, Process, ProcessEnded, ProcessProtocol, ProcessReaper, ProcessTransport, Signal, SpawnConfig,
	TransportError,
};
use support::TestReactor;

#[derive(Default)]
struct Log {
	out: Vec<u8>,
	err: Vec<u8>,
	/// Output on descriptors above 2.
	extra: BTreeMap<RawFd, Vec<u8>>,
	events: Vec<&'static str>,
	exited: Option<ProcessEnded>,
	ended: Option<ProcessEnded>,
}

struct Recorder(Rc<RefCell<Log>>);

impl ProcessProtocol for Recorder {
	fn out_received(&mut self, data: &[u8]) {
		self.0.borrow_mut().out.extend_from_slice(data);
	}

	fn err_received(&mut self, data: &[u8]) {
		self.0.borrow_mut().err.extend_from_slice(data);
	}

	fn in_connection_lost(&mut self) {
		self.0.borrow_mut().events.push("stdin");
	}

	fn out_connection_lost(&mut self) {
		self.0.borrow_mut().events.push("stdout");
	}

	fn err_connection_lost(&mut self) {
		self.0.borrow_mut().events.push("stderr");
	}

	fn child_data_received(&mut self, fd: RawFd, data: &[u8]) {
		match fd {
			1 => self.out_received(data),
			2 => self.err_received(data),
			_ => self.0.borrow_mut().extra.entry(fd).or_default().extend_from_slice(data),
		}
	}

	fn child_connection_lost(&mut self, fd: RawFd) {
		match fd {
			0 => self.in_connection_lost(),
			1 => self.out_connection_lost(),
			2 => self.err_connection_lost(),
			_ => self.0.borrow_mut().events.push("extra"),
		}
	}

	fn process_exited(&mut self, status: ProcessEnded) {
		let mut log = self.0.borrow_mut();
		log.events.push("exited");
		log.exited = Some(status);
	}

	fn process_ended(&mut self, status: ProcessEnded) {
		let mut log = self.0.borrow_mut();
		log.events.push("ended");
		log.ended = Some(status);
	}
}

struct Run {
	reactor: Rc<TestReactor>,
	reaper: Rc<ProcessReaper>,
	process: Rc<Process>,
	log: Rc<RefCell<Log>>,
}

impl Run {
	fn start(config: SpawnConfig) -> Run {
		let reactor = TestReactor::new();
		let reaper = ProcessReaper::new();
		let log = Rc::new(RefCell::new(Log::default()));
		let process = Process::spawn(reactor.clone(), &reaper, Box::new(Recorder(log.clone())), &config).unwrap();
		Run {
			reactor,
			reaper,
			process,
			log,
		}
	}

	/// Turns the loop, standing in for a SIGCHLD handler, until the
	/// protocol hears `process_ended`.
	fn wait(&self) -> ProcessEnded {
		let reaper = self.reaper.clone();
		let log = self.log.clone();
		assert!(self.reactor.run_until(500, move || {
			reaper.reap_all();
			log.borrow().ended.is_some()
		}));
		self.log.borrow().ended.unwrap()
	}
}

fn sh(script: &str) -> SpawnConfig {
	SpawnConfig::new("/bin/sh").arg("-c").arg(script)
}

/// `(read end, write end)`, non-blocking and close-on-exec.
fn test_pipe() -> (OwnedFd, OwnedFd) {
	let mut fds = [0; 2];
	assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) }, 0);
	unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn read_available(fd: &OwnedFd) -> Vec<u8> {
	let mut buf = [0u8; 256];
	let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
	if n <= 0 { Vec::new() } else { buf[..n as usize].to_vec() }
}

#[test]
fn output_and_exit_code_are_reported() {
	let run = Run::start(sh("echo out; echo err >&2; exit 3"));
	assert!(run.process.pid().is_some());

	let status = run.wait();
	assert_eq!(
		status,
		ProcessEnded::Terminated {
			exit_code: Some(3),
			signal: None
		}
	);
	assert!(!status.is_clean());

	let log = run.log.borrow();
	assert_eq!(log.out, b"out\n");
	assert_eq!(log.err, b"err\n");
	assert_eq!(log.exited, Some(status));
	assert_eq!(log.events.last(), Some(&"ended"));
	for stream in ["stdin", "stdout", "stderr", "exited"] {
		assert_eq!(log.events.iter().filter(|e| **e == stream).count(), 1, "{stream}");
	}

	assert_eq!(run.process.pid(), None);
	assert_eq!(run.process.status(), Some(status));
	assert_eq!(run.reaper.pending(), 0);
	assert_eq!(run.reactor.registrations(), 0);
	assert_eq!(run.reactor.stale(), 0);
}

#[test]
fn stdin_reaches_the_child() {
	let run = Run::start(SpawnConfig::new("/bin/cat"));
	run.process.write(b"hello ");
	run.process.write_sequence(&[&b"from"[..], &b" stdin"[..]]);
	run.process.close_stdin();

	assert_eq!(run.wait(), ProcessEnded::Done);
	assert_eq!(run.log.borrow().out, b"hello from stdin");
	assert_eq!(run.process.pending_stdin(), 0);
}

#[test]
fn signal_terminates_the_child() {
	let run = Run::start(SpawnConfig::new("/bin/sleep").arg("30"));
	run.process.signal_process(Signal::Term).unwrap();

	assert_eq!(
		run.wait(),
		ProcessEnded::Terminated {
			exit_code: None,
			signal: Some(libc::SIGTERM)
		}
	);
	assert_eq!(
		run.process.signal_process("KILL".parse().unwrap()),
		Err(TransportError::ProcessExitedAlready)
	);
}

#[test]
fn launch_failure_is_reported_on_stderr() {
	let run = Run::start(SpawnConfig::new("/nonexistent/program"));
	assert_eq!(
		run.wait(),
		ProcessEnded::Terminated {
			exit_code: Some(1),
			signal: None
		}
	);
	let err = String::from_utf8(run.log.borrow().err.clone()).unwrap();
	assert_eq!(err, "cannot run /nonexistent/program: exec: ENOENT\n");
}

#[test]
fn environment_and_directory_are_applied() {
	let config = sh("echo \"$GREETING\"; pwd").env("GREETING", "hi").cwd("/");
	let run = Run::start(config);
	assert_eq!(run.wait(), ProcessEnded::Done);
	assert_eq!(run.log.borrow().out, b"hi\n/\n");
}

#[test]
fn closing_every_pipe_still_waits_for_exit() {
	let run = Run::start(sh("exec 0<&- 1>&- 2>&-; sleep 0.2"));
	run.process.lose_connection();
	let status = run.wait();
	assert!(status.is_clean());
	let log = run.log.borrow();
	assert_eq!(log.events.iter().position(|e| *e == "exited").map(|i| i + 1), Some(log.events.len() - 1));
}

#[test]
fn extra_descriptor_output_is_delivered_by_number() {
	let run = Run::start(sh("echo side >&3; echo main").child_fd(3, ChildFd::FromChild));
	assert_eq!(run.wait(), ProcessEnded::Done);

	let log = run.log.borrow();
	assert_eq!(log.out, b"main\n");
	assert_eq!(log.extra.get(&3).map(Vec::as_slice), Some(&b"side\n"[..]));
	assert_eq!(log.events.iter().filter(|e| **e == "extra").count(), 1);
	assert_eq!(log.events.last(), Some(&"ended"));
	assert_eq!(run.reactor.registrations(), 0);
}

#[test]
fn extra_descriptor_can_feed_the_child() {
	let run = Run::start(sh("cat <&3").child_fd(3, ChildFd::ToChild));
	run.process.write_to_child(3, b"via three");
	// not a pipe towards the child
	run.process.write_to_child(1, b"dropped");
	run.process.close_child_fd(3);
	run.process.close_stdin();

	assert_eq!(run.wait(), ProcessEnded::Done);
	assert_eq!(run.log.borrow().out, b"via three");
}

#[test]
fn descriptors_land_in_place_when_sources_collide_with_targets() {
	let (a_read, a_write) = test_pipe();
	let (b_read, b_write) = test_pipe();
	let (c_read, c_write) = test_pipe();
	let (a, b, c) = (a_write.as_raw_fd(), b_write.as_raw_fd(), c_write.as_raw_fd());

	// a and b swap places; c stays where it is but must survive exec
	let config = sh(r#"echo one >&"$1"; echo two >&"$2"; echo three >&"$3""#)
		.arg("sh")
		.args([a.to_string(), b.to_string(), c.to_string()])
		.child_fd(a, ChildFd::Inherit(b))
		.child_fd(b, ChildFd::Inherit(a))
		.child_fd(c, ChildFd::Inherit(c));
	let run = Run::start(config);
	assert_eq!(run.wait(), ProcessEnded::Done);
	assert!(run.log.borrow().err.is_empty(), "{:?}", String::from_utf8_lossy(&run.log.borrow().err));

	assert_eq!(read_available(&a_read), b"two\n");
	assert_eq!(read_available(&b_read), b"one\n");
	assert_eq!(read_available(&c_read), b"three\n");
}
