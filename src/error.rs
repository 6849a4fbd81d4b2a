/// Socket creation/configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
	#[error("socket() failed: {}", errno_to_str(*.errno))]
	Create { errno: i32 },

	#[error("bind({addr}) failed: {}", errno_to_str(*.errno))]
	Bind { errno: i32, addr: String },

	#[error("listen(backlog={backlog}) failed: {}", errno_to_str(*.errno))]
	Listen { errno: i32, backlog: i32 },

	#[error("connect({addr}) failed: {}", errno_to_str(*.errno))]
	Connect { errno: i32, addr: String },

	#[error("accept() failed: {}", errno_to_str(*.errno))]
	Accept { errno: i32 },

	#[error("setsockopt({option}) failed: {}", errno_to_str(*.errno))]
	SetOption { errno: i32, option: &'static str },

	#[error("getsockopt({option}) failed: {}", errno_to_str(*.errno))]
	GetOption { errno: i32, option: &'static str },

	#[error("invalid address: {reason}")]
	InvalidAddress { reason: &'static str },
}

impl SocketError {
	/// Returns the OS error code behind this failure.
	pub fn errno(&self) -> i32 {
		match self {
			SocketError::Create { errno } => *errno,
			SocketError::Bind { errno, .. } => *errno,
			SocketError::Listen { errno, .. } => *errno,
			SocketError::Connect { errno, .. } => *errno,
			SocketError::Accept { errno } => *errno,
			SocketError::SetOption { errno, .. } => *errno,
			SocketError::GetOption { errno, .. } => *errno,
			SocketError::InvalidAddress { .. } => libc::EINVAL,
		}
	}
}

/// Why a connected transport went away.
///
/// Delivered exactly once to the bound protocol's `connection_lost`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
	/// Orderly close: EOF from the peer, a clean TLS shutdown, or a local
	/// `lose_connection` that finished flushing.
	#[error("connection was closed cleanly")]
	Done,

	#[error("connection was lost: {}", describe_errno(*.errno))]
	Lost { errno: Option<i32> },

	#[error("connection was aborted locally")]
	Aborted,

	#[error("TLS failure: {message}")]
	Tls { message: String },
}

impl CloseReason {
	pub(crate) fn from_io(err: &std::io::Error) -> Self {
		CloseReason::Lost { errno: err.raw_os_error() }
	}

	/// True for `Done`.
	pub fn is_clean(&self) -> bool {
		matches!(self, CloseReason::Done)
	}
}

/// Failure to establish an outbound stream connection.
///
/// Reported to the connector's factory, never to a protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
	#[error("connection refused ({})", errno_label(*.errno))]
	Refused { errno: i32 },

	#[error("connection timed out")]
	TimedOut { errno: Option<i32> },

	#[error("unknown host: {host}")]
	UnknownHost { host: String },

	#[error("could not bind {addr} ({})", errno_label(*.errno))]
	Bind { errno: i32, addr: String },

	#[error("no route to host ({})", errno_label(*.errno))]
	NoRoute { errno: i32 },

	#[error("connection attempt cancelled by user")]
	Cancelled,

	#[error("bad socket file: {reason}")]
	BadFile { reason: &'static str },

	#[error("factory declined to build a protocol")]
	NoProtocol,

	#[error("connect failed ({})", errno_label(*.errno))]
	Os { errno: i32 },
}

impl ConnectError {
	/// Classifies a failed `connect()` errno.
	pub fn from_errno(errno: i32) -> Self {
		match errno {
			libc::ECONNREFUSED => ConnectError::Refused { errno },
			libc::ETIMEDOUT => ConnectError::TimedOut { errno: Some(errno) },
			libc::ENETUNREACH | libc::EHOSTUNREACH => ConnectError::NoRoute { errno },
			_ => ConnectError::Os { errno },
		}
	}

	/// Numeric OS error code, when the failure came from the OS.
	pub fn errno(&self) -> Option<i32> {
		match self {
			ConnectError::Refused { errno }
			| ConnectError::Bind { errno, .. }
			| ConnectError::NoRoute { errno }
			| ConnectError::Os { errno } => Some(*errno),
			ConnectError::TimedOut { errno } => *errno,
			_ => None,
		}
	}

	/// Symbolic name of the OS error code (`"ECONNREFUSED"`).
	pub fn errno_name(&self) -> Option<&'static str> {
		self.errno().map(errno_name)
	}
}

/// A listening socket could not be set up. Raised out of `start_listening`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CannotListenError {
	#[error("couldn't listen on {addr}: {}", errno_to_str(*.errno))]
	Os { addr: String, errno: i32 },

	#[error("couldn't listen on {addr}: lock held by live process {pid}")]
	Locked { addr: String, pid: i32 },

	#[error("couldn't listen on {addr}: already listening")]
	AlreadyListening { addr: String },
}

impl CannotListenError {
	pub(crate) fn from_socket(addr: String, err: SocketError) -> Self {
		CannotListenError::Os { addr, errno: err.errno() }
	}
}

/// Synchronous failures raised out of a datagram `write`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
	#[error("message too long ({len} bytes)")]
	MessageTooLong { len: usize },

	#[error("datagram refused by peer")]
	ConnectionRefused,

	#[error("unconnected datagram write needs a destination")]
	NoDestination,

	#[error("destination differs from the connected peer")]
	AddressMismatch,

	#[error("already connected, reconnecting is not supported")]
	AlreadyConnected,

	#[error("connected mode needs an IP literal, not {host}")]
	NotAnAddress { host: String },

	#[error("send would block")]
	WouldBlock,

	#[error("port is not listening")]
	NotListening,

	#[error("datagram I/O failed: {}", errno_to_str(*.errno))]
	Os { errno: i32 },
}

impl DatagramError {
	pub(crate) fn from_errno(errno: i32, len: usize) -> Self {
		match errno {
			libc::EMSGSIZE => DatagramError::MessageTooLong { len },
			libc::ECONNREFUSED => DatagramError::ConnectionRefused,
			libc::EAGAIN => DatagramError::WouldBlock,
			_ => DatagramError::Os { errno },
		}
	}
}

/// Joining or leaving a multicast group failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MulticastJoinError {
	#[error("could not resolve {name}")]
	Resolve { name: String },

	#[error("membership change for {group} on {interface} failed: {}", errno_to_str(*.errno))]
	Os { group: String, interface: String, errno: i32 },
}

/// Misuse of a transport, connector or process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
	#[error("transport is not connected")]
	NotConnected,

	#[error("TLS was already started on this connection")]
	TlsAlreadyStarted,

	#[error("TLS setup failed: {message}")]
	Tls { message: String },

	#[error("connector is already connecting or connected")]
	AlreadyConnecting,

	#[error("connector is not connecting")]
	NotConnecting,

	#[error("process has already exited")]
	ProcessExitedAlready,

	#[error("unknown signal name {name:?}")]
	UnknownSignal { name: String },

	#[error("signal delivery failed: {}", errno_to_str(*.errno))]
	Signal { errno: i32 },

	#[error("spawn failed: {}", errno_to_str(*.errno))]
	Spawn { errno: i32 },

	#[error("invalid spawn argument: {reason}")]
	InvalidArgument { reason: &'static str },
}

/// Returns current errno value.
#[inline]
pub fn errno() -> i32 {
	unsafe { *libc::__errno_location() }
}

/// Symbolic name for an errno value, `"E?"` when unknown.
pub fn errno_name(errno: i32) -> &'static str {
	match errno {
		libc::EPERM => "EPERM",
		libc::ENOENT => "ENOENT",
		libc::EINTR => "EINTR",
		libc::EBADF => "EBADF",
		libc::ECHILD => "ECHILD",
		libc::EAGAIN => "EAGAIN",
		libc::ENOMEM => "ENOMEM",
		libc::EACCES => "EACCES",
		libc::EINVAL => "EINVAL",
		libc::ENFILE => "ENFILE",
		libc::EMFILE => "EMFILE",
		libc::EPIPE => "EPIPE",
		libc::ENOTSOCK => "ENOTSOCK",
		libc::EMSGSIZE => "EMSGSIZE",
		libc::EAFNOSUPPORT => "EAFNOSUPPORT",
		libc::EADDRINUSE => "EADDRINUSE",
		libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
		libc::ENETUNREACH => "ENETUNREACH",
		libc::ECONNABORTED => "ECONNABORTED",
		libc::ECONNRESET => "ECONNRESET",
		libc::ENOBUFS => "ENOBUFS",
		libc::EISCONN => "EISCONN",
		libc::ENOTCONN => "ENOTCONN",
		libc::ETIMEDOUT => "ETIMEDOUT",
		libc::ECONNREFUSED => "ECONNREFUSED",
		libc::EHOSTUNREACH => "EHOSTUNREACH",
		libc::EALREADY => "EALREADY",
		libc::EINPROGRESS => "EINPROGRESS",
		libc::ESRCH => "ESRCH",
		_ => "E?",
	}
}

/// Converts errno to human-readable string.
fn errno_to_str(errno: i32) -> String {
	let text = match errno {
		libc::EACCES => "permission denied",
		libc::EADDRINUSE => "address already in use",
		libc::EADDRNOTAVAIL => "address not available",
		libc::EAFNOSUPPORT => "address family not supported",
		libc::EAGAIN => "resource temporarily unavailable",
		libc::EBADF => "bad file descriptor",
		libc::ECONNABORTED => "software caused connection abort",
		libc::ECONNREFUSED => "connection refused",
		libc::ECONNRESET => "connection reset by peer",
		libc::EHOSTUNREACH => "no route to host",
		libc::EINPROGRESS => "operation in progress",
		libc::EINTR => "interrupted by signal",
		libc::EINVAL => "invalid argument",
		libc::EMFILE => "too many open files",
		libc::EMSGSIZE => "message too long",
		libc::ENETUNREACH => "network unreachable",
		libc::ENFILE => "file table overflow",
		libc::ENOBUFS => "no buffer space available",
		libc::ENOENT => "no such file or directory",
		libc::ENOMEM => "out of memory",
		libc::ENOTCONN => "not connected",
		libc::EPIPE => "broken pipe",
		libc::ETIMEDOUT => "connection timed out",
		_ => return format!("errno {}", errno),
	};
	format!("{} ({})", text, errno_name(errno))
}

fn errno_label(errno: i32) -> String {
	format!("{}, errno {}", errno_name(errno), errno)
}

fn describe_errno(errno: Option<i32>) -> String {
	match errno {
		Some(e) => errno_to_str(e),
		None => "non-clean shutdown".into(),
	}
}

/// Maps errno to std::io::ErrorKind.
fn errno_to_kind(errno: i32) -> std::io::ErrorKind {
	match errno {
		libc::EACCES | libc::EPERM => std::io::ErrorKind::PermissionDenied,
		libc::EADDRINUSE => std::io::ErrorKind::AddrInUse,
		libc::EADDRNOTAVAIL => std::io::ErrorKind::AddrNotAvailable,
		libc::EAGAIN => std::io::ErrorKind::WouldBlock,
		libc::ECONNREFUSED => std::io::ErrorKind::ConnectionRefused,
		libc::ECONNRESET => std::io::ErrorKind::ConnectionReset,
		libc::EINTR => std::io::ErrorKind::Interrupted,
		libc::EINVAL => std::io::ErrorKind::InvalidInput,
		libc::ENOTCONN => std::io::ErrorKind::NotConnected,
		libc::EPIPE => std::io::ErrorKind::BrokenPipe,
		libc::ETIMEDOUT => std::io::ErrorKind::TimedOut,
		_ => std::io::ErrorKind::Other,
	}
}

impl From<SocketError> for std::io::Error {
	fn from(err: SocketError) -> Self {
		std::io::Error::new(errno_to_kind(err.errno()), err)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connect_error_carries_code_and_symbol() {
		let err = ConnectError::from_errno(libc::ECONNREFUSED);
		assert_eq!(err, ConnectError::Refused { errno: libc::ECONNREFUSED });
		assert_eq!(err.errno(), Some(libc::ECONNREFUSED));
		assert_eq!(err.errno_name(), Some("ECONNREFUSED"));
		assert!(err.to_string().contains("ECONNREFUSED"));
	}

	#[test]
	fn cancelled_has_no_errno() {
		assert_eq!(ConnectError::Cancelled.errno(), None);
		assert_eq!(ConnectError::Cancelled.errno_name(), None);
	}

	#[test]
	fn datagram_errno_translation() {
		assert_eq!(
			DatagramError::from_errno(libc::EMSGSIZE, 70000),
			DatagramError::MessageTooLong { len: 70000 }
		);
		assert_eq!(DatagramError::from_errno(libc::ECONNREFUSED, 1), DatagramError::ConnectionRefused);
		assert_eq!(DatagramError::from_errno(libc::EBADF, 1), DatagramError::Os { errno: libc::EBADF });
	}

	#[test]
	fn close_reason_display() {
		assert!(CloseReason::Done.is_clean());
		let lost = CloseReason::Lost { errno: Some(libc::ECONNRESET) };
		assert!(!lost.is_clean());
		assert!(lost.to_string().contains("reset by peer"));
		assert!(CloseReason::Lost { errno: None }.to_string().contains("non-clean"));
	}

	#[test]
	fn socket_error_into_io_error_keeps_kind() {
		let io: std::io::Error = SocketError::Bind { errno: libc::EADDRINUSE, addr: "x".into() }.into();
		assert_eq!(io.kind(), std::io::ErrorKind::AddrInUse);
	}
}
