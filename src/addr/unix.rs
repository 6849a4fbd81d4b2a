use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::addr::{Address, Domain, SockAddr, SocketKind, ToSockAddr};

/// Unix domain socket marker.
///
/// Sockets with this domain use filesystem paths (e.g., /tmp/app.sock).
/// Only works on the same machine.
pub struct Unix;

impl Domain for Unix {
	type Addr = UnixAddr;

	#[inline]
	fn raw() -> libc::c_int {
		libc::AF_UNIX
	}
}

/// Unix domain socket address (file path, abstract name, or unnamed).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixAddr {
	path: Vec<u8>,
	/// True if this is an abstract socket (Linux-only, no filesystem entry).
	is_abstract: bool,
}

impl UnixAddr {
	/// Creates a new Unix address from a filesystem path.
	pub fn new<P: AsRef<[u8]>>(path: P) -> Self {
		Self {
			path: path.as_ref().to_vec(),
			is_abstract: false,
		}
	}

	/// Creates from a string path.
	pub fn from_str(path: &str) -> Self {
		Self::new(path.as_bytes())
	}

	/// Creates from a filesystem path.
	pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
		Self::new(path.as_ref().as_os_str().as_bytes())
	}

	/// Creates an abstract socket address (Linux-only).
	///
	/// Abstract sockets exist only in memory and have no filesystem entry.
	pub fn abstract_socket<P: AsRef<[u8]>>(name: P) -> Self {
		Self {
			path: name.as_ref().to_vec(),
			is_abstract: true,
		}
	}

	/// The address of a socket that was never bound.
	pub fn unnamed() -> Self {
		Self { path: Vec::new(), is_abstract: false }
	}

	/// Returns true if this is an abstract socket.
	pub fn is_abstract(&self) -> bool {
		self.is_abstract
	}

	/// Returns true for unbound sockets.
	pub fn is_unnamed(&self) -> bool {
		!self.is_abstract && self.path.is_empty()
	}

	/// Returns the path bytes.
	pub fn path(&self) -> &[u8] {
		&self.path
	}

	/// Filesystem path, `None` for abstract and unnamed sockets.
	pub fn fs_path(&self) -> Option<PathBuf> {
		if self.is_abstract || self.path.is_empty() {
			return None;
		}
		Some(PathBuf::from(std::ffi::OsStr::from_bytes(&self.path)))
	}

	/// Converts to the raw sockaddr_un for syscalls, with the exact length.
	pub(crate) fn to_raw(&self) -> Option<(libc::sockaddr_un, libc::socklen_t)> {
		let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
		addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
		let base = std::mem::size_of::<libc::sa_family_t>();

		let used = if self.is_abstract {
			// Abstract: first byte is null, then the name
			if self.path.len() + 1 > addr.sun_path.len() {
				return None;
			}
			for (i, &byte) in self.path.iter().enumerate() {
				addr.sun_path[i + 1] = byte as libc::c_char;
			}
			self.path.len() + 1
		} else {
			// Filesystem path: null-terminated
			if self.path.len() >= addr.sun_path.len() {
				return None;
			}
			for (i, &byte) in self.path.iter().enumerate() {
				addr.sun_path[i] = byte as libc::c_char;
			}
			self.path.len() + 1
		};

		Some((addr, (base + used) as libc::socklen_t))
	}

	/// Creates from raw sockaddr_un; `path_len` is the kernel-reported
	/// length minus the family field.
	pub(crate) fn from_raw(raw: &libc::sockaddr_un, path_len: usize) -> Self {
		let path_len = path_len.min(raw.sun_path.len());
		let bytes: Vec<u8> = raw.sun_path[..path_len].iter().map(|&c| c as u8).collect();

		match bytes.first() {
			None => Self::unnamed(),
			Some(0) => Self { path: bytes[1..].to_vec(), is_abstract: true },
			Some(_) => {
				let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
				Self { path: bytes[..end].to_vec(), is_abstract: false }
			}
		}
	}
}

impl fmt::Display for UnixAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_abstract {
			write!(f, "@{}", String::from_utf8_lossy(&self.path))
		} else if self.path.is_empty() {
			f.write_str("<unnamed>")
		} else {
			f.write_str(&String::from_utf8_lossy(&self.path))
		}
	}
}

impl ToSockAddr for UnixAddr {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		let (raw, len) = self.to_raw()?;
		let ptr = &raw as *const _ as *const libc::sockaddr;
		Some(f(ptr, len))
	}
}

impl SockAddr for UnixAddr {
	fn to_address(&self, _kind: SocketKind) -> Address {
		Address::Unix { path: self.fs_path() }
	}

	fn from_address(addr: &Address) -> Option<Self> {
		match addr {
			Address::Unix { path: Some(path) } => Some(Self::from_path(path)),
			_ => None,
		}
	}
}
