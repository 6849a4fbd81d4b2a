mod support;

use std::rc::Rc;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use reactorlane::{
	CloseReason, ConnectConfig, Connector, ConnectorControl, Ipv4, Port, PortConfig, SocketAddrV4, Target, TlsContext,
	TransportError,
};
use support::{ClientRecorder, Seen, ServerFactory, TestReactor};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

fn contexts() -> (TlsContext, TlsContext) {
	let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
	let cert: CertificateDer<'static> = certified.cert.der().clone();
	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

	let server = ServerConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(vec![cert.clone()], key)
		.unwrap();

	let mut roots = RootCertStore::empty();
	roots.add(cert).unwrap();
	let client = ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.unwrap()
		.with_root_certificates(roots)
		.with_no_client_auth();

	(
		TlsContext::server(Arc::new(server)),
		TlsContext::client(Arc::new(client), "localhost").unwrap(),
	)
}

struct Pair {
	reactor: Rc<TestReactor>,
	port: Rc<Port<Ipv4>>,
	client: Rc<Seen>,
	server: Rc<Seen>,
	_connector: Rc<Connector<Ipv4>>,
}

fn connected_pair() -> Pair {
	let reactor = TestReactor::new();
	let factory = ServerFactory::shared(false);
	let port = Port::<Ipv4>::listen(reactor.clone(), SocketAddrV4::localhost(0), factory.clone(), PortConfig::new()).unwrap();
	let recorder = ClientRecorder::shared();
	let connector = Connector::<Ipv4>::new(
		reactor.clone(),
		Target::Addr(port.local_addr().unwrap()),
		recorder.clone(),
		ConnectConfig::new(),
	);
	connector.connect().unwrap();
	assert!(reactor.run_until(100, || {
		!recorder.borrow().seen.is_empty() && !factory.borrow().connections.is_empty()
	}));
	let client = recorder.borrow().last();
	let server = factory.borrow().connections[0].1.clone();
	Pair {
		reactor,
		port,
		client,
		server,
		_connector: connector,
	}
}

#[test]
fn upgrade_after_plaintext_negotiation() {
	let pair = connected_pair();
	let (server_ctx, client_ctx) = contexts();

	pair.client.transport().write(b"STARTTLS\n");
	assert!(pair.reactor.run_until(100, || pair.server.received() == 9));

	pair.server.transport().start_tls(server_ctx.clone()).unwrap();
	pair.client.transport().start_tls(client_ctx).unwrap();
	assert_eq!(
		pair.server.transport().start_tls(server_ctx),
		Err(TransportError::TlsAlreadyStarted)
	);

	pair.client.transport().write(b"secret");
	pair.server.transport().write(b"welcome");
	assert!(pair.reactor.run_until(200, || pair.server.received() == 15 && pair.client.received() == 7));
	assert_eq!(*pair.server.data.borrow(), b"STARTTLS\nsecret");
	assert_eq!(*pair.client.data.borrow(), b"welcome");

	pair.client.transport().lose_connection();
	assert!(pair.reactor.run_until(200, || pair.server.is_lost() && pair.client.is_lost()));
	assert_eq!(*pair.server.lost.borrow(), Some(CloseReason::Done));

	let stopped = pair.port.stop_listening();
	assert!(pair.reactor.run_until(50, || stopped.is_fired()));
	assert_eq!(pair.reactor.registrations(), 0);
}

#[test]
fn queued_plaintext_goes_out_before_the_handshake() {
	let pair = connected_pair();
	let (server_ctx, client_ctx) = contexts();

	pair.server.transport().write(b"plain;");
	pair.server.transport().start_tls(server_ctx).unwrap();
	// held back until the upgrade
	pair.server.transport().write(b"sealed");

	assert!(pair.reactor.run_until(100, || pair.client.received() == 6));
	assert_eq!(*pair.client.data.borrow(), b"plain;");

	pair.client.transport().start_tls(client_ctx).unwrap();
	assert!(pair.reactor.run_until(200, || pair.client.received() == 12));
	assert_eq!(*pair.client.data.borrow(), b"plain;sealed");

	pair.server.transport().lose_connection();
	assert!(pair.reactor.run_until(200, || pair.server.is_lost() && pair.client.is_lost()));
}

#[test]
fn close_during_handshake_still_delivers_written_bytes() {
	let pair = connected_pair();
	let (server_ctx, client_ctx) = contexts();

	pair.server.transport().start_tls(server_ctx).unwrap();
	pair.client.transport().start_tls(client_ctx).unwrap();
	pair.client.transport().write(b"secret");
	pair.client.transport().lose_connection();

	assert!(pair.reactor.run_until(200, || pair.server.is_lost() && pair.client.is_lost()));
	assert_eq!(*pair.server.data.borrow(), b"secret");
	assert_eq!(*pair.client.lost.borrow(), Some(CloseReason::Done));
	assert_eq!(*pair.server.lost.borrow(), Some(CloseReason::Done));
}

#[test]
fn handshake_failure_closes_with_tls_reason() {
	let pair = connected_pair();
	let (server_ctx, _) = contexts();
	// a client that trusts nothing
	let untrusting = ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.unwrap()
		.with_root_certificates(RootCertStore::empty())
		.with_no_client_auth();
	let client_ctx = TlsContext::client(Arc::new(untrusting), "localhost").unwrap();

	pair.server.transport().start_tls(server_ctx).unwrap();
	pair.client.transport().start_tls(client_ctx).unwrap();
	pair.client.transport().write(b"never readable");

	assert!(pair.reactor.run_until(200, || pair.client.is_lost() && pair.server.is_lost()));
	assert!(matches!(*pair.client.lost.borrow(), Some(CloseReason::Tls { .. })));
	assert!(pair.server.data.borrow().is_empty());
}

#[test]
fn start_tls_needs_a_live_connection() {
	let pair = connected_pair();
	let (_, client_ctx) = contexts();
	let transport = pair.client.transport();
	transport.lose_connection();
	assert_eq!(transport.start_tls(client_ctx), Err(TransportError::NotConnected));
}
