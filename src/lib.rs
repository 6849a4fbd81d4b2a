//! Non-blocking socket and pipe transports driven by an external reactor.
//!
//! The crate never blocks and never runs an event loop. A [`Reactor`]
//! implementation tells transports when their descriptors are ready; the
//! transports do one operation per event and report to application
//! [`Protocol`]s and [`Factory`]s.

pub mod socket;
pub mod tcp;
pub mod udp;
pub mod process;
mod addr;
mod config;
mod deferred;
mod error;
mod handle;
mod protocol;
mod reactor;

pub use self::error::{
	CannotListenError, CloseReason, ConnectError, DatagramError, MulticastJoinError, SocketError, TransportError,
	errno, errno_name,
};
pub use self::addr::{Address, Domain, Ipv4, Ipv6, SockAddr, SocketAddrV4, SocketAddrV6, SocketKind, Unix, UnixAddr};
pub use self::config::{
	AcceptPolicy, BufferConfig, ChildFd, ConnectConfig, DatagramConfig, KeepaliveConfig, PortConfig, ReuseConfig,
	SpawnConfig, TcpConfig, UnixListenConfig,
};
pub use self::deferred::Deferred;
pub use self::handle::{Interest, IoOutcome, IoStrategy, PlainIo, RawIo};
pub use self::protocol::{
	ClientFactory, ConnectorControl, DatagramProtocol, DatagramTransport, Factory, ProcessProtocol,
	ProcessTransport, Protocol, Transport,
};
pub use self::reactor::{DelayedCall, Reactor, ResolveCallback, Selectable};
pub use self::tcp::{AcceptBudget, Client, ClientState, Connection, Connector, ConnectorState, Port, Target, TlsContext};
pub use self::udp::{DatagramPort, MulticastResult};
pub use self::process::{Process, ProcessEnded, ProcessReaper, Signal};
