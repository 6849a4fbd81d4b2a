use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, error};

use super::client::{Client, Target};
use crate::addr::{Address, Domain};
use crate::config::ConnectConfig;
use crate::error::{CloseReason, ConnectError, TransportError};
use crate::protocol::{ClientFactory, ConnectorControl, Protocol, with_factory};
use crate::reactor::{DelayedCall, Reactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
	Disconnected,
	Connecting,
	Connected,
}

/// Owns one outbound connection at a time and reports its fate to a
/// [`ClientFactory`].
///
/// The connector never retries by itself; a factory that wants to can
/// call `connect()` again from `client_connection_failed` or
/// `client_connection_lost`.
pub struct Connector<D: Domain> {
	this: Weak<Self>,
	reactor: Rc<dyn Reactor>,
	factory: Rc<RefCell<dyn ClientFactory>>,
	factory_prefix: String,
	target: Target<D>,
	config: ConnectConfig<D>,
	state: Cell<ConnectorState>,
	factory_started: Cell<bool>,
	client: RefCell<Option<Rc<Client<D>>>>,
	timeout_call: Cell<Option<DelayedCall>>,
}

impl<D: Domain> Connector<D> {
	pub fn new(
		reactor: Rc<dyn Reactor>,
		target: Target<D>,
		factory: Rc<RefCell<dyn ClientFactory>>,
		config: ConnectConfig<D>,
	) -> Rc<Self> {
		let factory_prefix = factory.borrow().log_prefix();
		Rc::new_cyclic(|this| Self {
			this: this.clone(),
			reactor,
			factory,
			factory_prefix,
			target,
			config,
			state: Cell::new(ConnectorState::Disconnected),
			factory_started: Cell::new(false),
			client: RefCell::new(None),
			timeout_call: Cell::new(None),
		})
	}

	/// Creates a connector for `host:port` and starts connecting.
	pub fn connect_to(
		reactor: Rc<dyn Reactor>,
		host: &str,
		port: u16,
		factory: Rc<RefCell<dyn ClientFactory>>,
		config: ConnectConfig<D>,
	) -> Rc<Self> {
		let target = Target::Host {
			host: host.to_owned(),
			port,
		};
		let connector = Self::new(reactor, target, factory, config);
		// a fresh connector is always disconnected
		let _ = connector.connect();
		connector
	}

	pub fn state(&self) -> ConnectorState {
		self.state.get()
	}

	/// The in-flight attempt, if any.
	pub fn client(&self) -> Option<Rc<Client<D>>> {
		self.client.borrow().clone()
	}

	pub(crate) fn factory_prefix(&self) -> &str {
		&self.factory_prefix
	}

	fn cancel_timeout(&self) {
		if let Some(call) = self.timeout_call.take() {
			self.reactor.cancel_call(call);
		}
	}

	fn self_rc(&self) -> Option<Rc<Self>> {
		self.this.upgrade()
	}

	/// Called by the client once the socket is connected. Moves to
	/// `Connected` whatever the factory answers.
	pub(crate) fn build_protocol(&self, addr: &Address) -> Option<Box<dyn Protocol>> {
		self.state.set(ConnectorState::Connected);
		self.cancel_timeout();
		match self.factory.try_borrow_mut() {
			Ok(mut factory) => factory.build_protocol(addr),
			Err(_) => {
				error!(prefix = %self.factory_prefix, "factory busy while building a client protocol");
				None
			}
		}
	}

	pub(crate) fn connection_failed(&self, reason: ConnectError) {
		self.cancel_timeout();
		*self.client.borrow_mut() = None;
		self.state.set(ConnectorState::Disconnected);
		debug!(prefix = %self.factory_prefix, destination = %self.target.to_address(), error = %reason, "connection failed");

		let Some(this) = self.self_rc() else { return };
		with_factory(&self.reactor, &self.factory, move |factory| {
			factory.client_connection_failed(&*this, reason);
			this.stop_factory_if_idle(factory);
		});
	}

	pub(crate) fn connection_lost(&self, reason: CloseReason) {
		*self.client.borrow_mut() = None;
		self.state.set(ConnectorState::Disconnected);

		let Some(this) = self.self_rc() else { return };
		with_factory(&self.reactor, &self.factory, move |factory| {
			factory.client_connection_lost(&*this, reason);
			this.stop_factory_if_idle(factory);
		});
	}

	fn stop_factory_if_idle(&self, factory: &mut dyn ClientFactory) {
		if self.state.get() == ConnectorState::Disconnected && self.factory_started.replace(false) {
			factory.do_stop();
		}
	}
}

impl<D: Domain> ConnectorControl for Connector<D> {
	/// Starts one attempt. Errors if one is already running or connected.
	fn connect(&self) -> Result<(), TransportError> {
		if self.state.get() != ConnectorState::Disconnected {
			return Err(TransportError::AlreadyConnecting);
		}
		self.state.set(ConnectorState::Connecting);

		if !self.factory_started.replace(true) {
			with_factory(&self.reactor, &self.factory, |factory| factory.do_start());
		}

		let client = Client::new(self.reactor.clone(), self.this.clone(), self.target.clone(), self.config.clone());
		*self.client.borrow_mut() = Some(client.clone());

		if let Some(timeout) = self.config.timeout {
			let client = Rc::downgrade(&client);
			let call = self.reactor.call_later(
				timeout,
				Box::new(move || {
					if let Some(client) = client.upgrade() {
						client.fail_if_not_connected(ConnectError::TimedOut { errno: None });
					}
				}),
			);
			self.timeout_call.set(Some(call));
		}

		if let Some(this) = self.self_rc() {
			with_factory(&self.reactor, &self.factory, move |factory| factory.started_connecting(&*this));
		}
		Ok(())
	}

	/// Cancels the running attempt; the factory sees `ConnectError::Cancelled`.
	fn stop_connecting(&self) -> Result<(), TransportError> {
		if self.state.get() != ConnectorState::Connecting {
			return Err(TransportError::NotConnecting);
		}
		self.state.set(ConnectorState::Disconnected);
		let client = self.client.borrow().clone();
		if let Some(client) = client {
			client.stop_connecting();
		}
		Ok(())
	}

	/// Stops connecting, or closes the established connection.
	fn disconnect(&self) {
		match self.state.get() {
			ConnectorState::Connecting => {
				let _ = self.stop_connecting();
			}
			ConnectorState::Connected => {
				let conn = self.client.borrow().as_ref().and_then(|c| c.connection());
				if let Some(conn) = conn {
					crate::protocol::Transport::lose_connection(&*conn);
				}
			}
			ConnectorState::Disconnected => {}
		}
	}

	fn destination(&self) -> Address {
		self.target.to_address()
	}
}
