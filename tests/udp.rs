mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use reactorlane::{
	Address, DatagramConfig, DatagramError, DatagramPort, DatagramProtocol, DatagramTransport, Ipv4,
	MulticastJoinError, Selectable, SocketAddrV4,
};
use support::TestReactor;

#[derive(Default)]
struct Inbox {
	transport: Option<Rc<dyn DatagramTransport>>,
	datagrams: Vec<(Vec<u8>, Option<Address>)>,
	refused: usize,
	starts: usize,
	stops: usize,
}

impl DatagramProtocol for Inbox {
	fn make_connection(&mut self, transport: Rc<dyn DatagramTransport>) {
		self.transport = Some(transport);
	}

	fn do_start(&mut self) {
		self.starts += 1;
	}

	fn do_stop(&mut self) {
		self.stops += 1;
		self.transport = None;
	}

	fn datagram_received(&mut self, data: &[u8], addr: Option<&Address>) {
		self.datagrams.push((data.to_vec(), addr.cloned()));
	}

	fn connection_refused(&mut self) {
		self.refused += 1;
	}
}

fn bind(reactor: &Rc<TestReactor>, config: DatagramConfig) -> (Rc<DatagramPort<Ipv4>>, Rc<RefCell<Inbox>>) {
	let inbox = Rc::new(RefCell::new(Inbox::default()));
	let port = DatagramPort::<Ipv4>::listen(reactor.clone(), SocketAddrV4::localhost(0), inbox.clone(), config).unwrap();
	(port, inbox)
}

#[test]
fn unconnected_ports_exchange_datagrams() {
	let reactor = TestReactor::new();
	let (a, a_inbox) = bind(&reactor, DatagramConfig::new());
	let (b, b_inbox) = bind(&reactor, DatagramConfig::new());
	assert_eq!(a_inbox.borrow().starts, 1);
	assert!(a_inbox.borrow().transport.is_some());

	assert_eq!(a.write(b"one", Some(&b.get_host())), Ok(3));
	assert_eq!(a.write_sequence(&[&b"tw"[..], &b"o"[..]], Some(&b.get_host())), Ok(3));
	assert!(reactor.run_until(50, || b_inbox.borrow().datagrams.len() == 2));
	{
		let inbox = b_inbox.borrow();
		// one readiness event, one datagram: boundaries are kept
		assert_eq!(inbox.datagrams[0], (b"one".to_vec(), Some(a.get_host())));
		assert_eq!(inbox.datagrams[1].0, b"two");
	}

	let reply_to = b_inbox.borrow().datagrams[0].1.clone().unwrap();
	b.write(b"back", Some(&reply_to)).unwrap();
	assert!(reactor.run_until(50, || !a_inbox.borrow().datagrams.is_empty()));
	assert_eq!(a_inbox.borrow().datagrams[0], (b"back".to_vec(), Some(b.get_host())));
}

#[test]
fn connected_mode_hides_the_peer() {
	let reactor = TestReactor::new();
	let (a, a_inbox) = bind(&reactor, DatagramConfig::new());
	let (b, b_inbox) = bind(&reactor, DatagramConfig::new());
	let b_port = b.local_addr().unwrap().port();

	a.connect("127.0.0.1", b_port).unwrap();
	assert_eq!(a.peer(), Some(SocketAddrV4::localhost(b_port)));
	assert_eq!(a.connect("127.0.0.1", b_port), Err(DatagramError::AlreadyConnected));

	a.write(b"hello", None).unwrap();
	a.write(b"again", Some(&b.get_host())).unwrap();
	assert_eq!(a.write(b"x", Some(&a.get_host())), Err(DatagramError::AddressMismatch));
	assert!(reactor.run_until(50, || b_inbox.borrow().datagrams.len() == 2));

	b.write(b"reply", Some(&a.get_host())).unwrap();
	assert!(reactor.run_until(50, || !a_inbox.borrow().datagrams.is_empty()));
	assert_eq!(a_inbox.borrow().datagrams[0], (b"reply".to_vec(), None));
}

#[test]
fn oversized_and_misaddressed_writes_fail_synchronously() {
	let reactor = TestReactor::new();
	let (a, _) = bind(&reactor, DatagramConfig::new().max_packet_size(100));
	let (b, b_inbox) = bind(&reactor, DatagramConfig::new());
	assert_eq!(a.max_packet_size(), 100);

	assert_eq!(
		a.write(&[0; 101], Some(&b.get_host())),
		Err(DatagramError::MessageTooLong { len: 101 })
	);
	assert_eq!(a.write(b"where to?", None), Err(DatagramError::NoDestination));
	assert_eq!(
		a.connect("localhost", 9),
		Err(DatagramError::NotAnAddress {
			host: "localhost".into()
		})
	);
	assert_eq!(a.write(&[7; 100], Some(&b.get_host())), Ok(100));
	assert!(reactor.run_until(50, || b_inbox.borrow().datagrams.len() == 1));
}

#[test]
fn connected_port_hears_refusals() {
	let reactor = TestReactor::new();
	let (gone, _) = bind(&reactor, DatagramConfig::new());
	let gone_port = gone.local_addr().unwrap().port();
	let stopped = gone.stop_listening();
	assert!(reactor.run_until(10, || stopped.is_fired()));

	let (a, a_inbox) = bind(&reactor, DatagramConfig::new());
	a.connect("127.0.0.1", gone_port).unwrap();
	a.write(b"anyone?", None).unwrap();
	assert!(reactor.run_until(50, || a_inbox.borrow().refused > 0));
	assert!(a_inbox.borrow().datagrams.is_empty());
}

#[test]
fn stop_listening_fires_once_closed() {
	let reactor = TestReactor::new();
	let (a, a_inbox) = bind(&reactor, DatagramConfig::new());
	let fd = a.fileno();
	assert!(reactor.is_reading(fd));

	let stopped = a.stop_listening();
	assert!(!stopped.is_fired());
	assert!(!a.is_reading());
	let fired = Rc::new(Cell::new(false));
	let hit = fired.clone();
	stopped.add_callback(move |()| hit.set(true));

	assert!(reactor.run_until(10, || fired.get()));
	assert!(!a.is_listening());
	assert_eq!(a_inbox.borrow().stops, 1);
	assert!(a.stop_listening().is_fired());
	assert_eq!(a.write(b"late", Some(&a.get_host())), Err(DatagramError::NotListening));
	assert_eq!(reactor.registrations(), 0);
}

#[test]
fn multicast_options_round_trip() {
	let reactor = TestReactor::new();
	let (a, _) = bind(&reactor, DatagramConfig::new());

	a.set_ttl(4).unwrap();
	assert_eq!(a.get_ttl(), Ok(4));
	a.set_loopback_mode(false).unwrap();
	assert_eq!(a.get_loopback_mode(), Ok(false));

	let bad = a.join_group("no.such.group", "");
	assert!(reactor.run_until(10, || bad.is_fired()));
	assert_eq!(
		bad.result(),
		Some(Err(MulticastJoinError::Resolve {
			name: "no.such.group".into()
		}))
	);

	// the sandbox may have no multicast route; either outcome is definite
	let joined = a.join_group("239.255.0.7", "");
	assert!(joined.is_fired());
	match joined.result() {
		Some(Ok(())) => {
			assert_eq!(a.joined_groups(), vec!["239.255.0.7".parse::<std::net::Ipv4Addr>().unwrap()]);
			let left = a.leave_group("239.255.0.7", "");
			assert_eq!(left.result(), Some(Ok(())));
			assert!(a.joined_groups().is_empty());
		}
		Some(Err(MulticastJoinError::Os { .. })) => assert!(a.joined_groups().is_empty()),
		other => panic!("unexpected join outcome {:?}", other),
	}
}
