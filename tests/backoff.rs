//! Descriptor exhaustion is process wide, so this file holds a single test.

mod support;

use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use reactorlane::{ConnectConfig, Connector, ConnectorControl, Ipv4, Port, PortConfig, SocketAddrV4, Target};
use support::{ClientRecorder, ServerFactory, TestReactor};
use tracing_test::traced_test;

/// Lowers the soft descriptor limit and fills it up. Dropping the result
/// gives everything back.
struct Exhausted {
	fds: Vec<OwnedFd>,
	saved: libc::rlimit,
}

impl Exhausted {
	fn now() -> Exhausted {
		let mut saved = libc::rlimit {
			rlim_cur: 0,
			rlim_max: 0,
		};
		assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved) }, 0);
		let lowered = libc::rlimit {
			rlim_cur: saved.rlim_cur.min(256),
			rlim_max: saved.rlim_max,
		};
		assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);

		let mut fds = Vec::new();
		loop {
			let fd = unsafe { libc::dup(0) };
			if fd == -1 {
				assert_eq!(reactorlane::errno(), libc::EMFILE);
				break;
			}
			fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
		}
		Exhausted { fds, saved }
	}
}

impl Drop for Exhausted {
	fn drop(&mut self) {
		self.fds.clear();
		unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &self.saved) };
	}
}

#[test]
#[traced_test]
fn accept_pauses_on_descriptor_exhaustion() {
	let reactor = TestReactor::new();
	let server = ServerFactory::shared(false);
	let config = PortConfig::new().exhaustion_cooldown(Duration::from_secs(2));
	let port = Port::<Ipv4>::listen(reactor.clone(), SocketAddrV4::localhost(0), server.clone(), config).unwrap();

	// the client socket exists before the table fills up
	let client = ClientRecorder::shared();
	let connector = Connector::<Ipv4>::new(
		reactor.clone(),
		Target::Addr(port.local_addr().unwrap()),
		client.clone(),
		ConnectConfig::new().timeout(None),
	);
	connector.connect().unwrap();

	let exhausted = Exhausted::now();
	assert!(reactor.run_until(100, || !port.is_reading()));
	assert!(logs_contain("accept failed, pausing"));
	assert!(logs_contain("EMFILE"));
	assert!(server.borrow().connections.is_empty());

	// still paused: the pending peer is not offered to the factory
	for _ in 0..5 {
		reactor.iterate(Duration::from_millis(10));
	}
	assert!(!port.is_reading());
	assert!(server.borrow().connections.is_empty());
	drop(exhausted);

	reactor.advance(Duration::from_secs(1));
	assert!(!port.is_reading());
	reactor.advance(Duration::from_secs(1));
	assert!(port.is_reading());
	assert!(reactor.run_until(100, || server.borrow().connections.len() == 1));
	assert_eq!(port.sessions(), 1);

	let stopped = port.stop_listening();
	assert!(reactor.run_until(50, || stopped.is_fired()));
}
