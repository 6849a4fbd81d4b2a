//! fork/exec with the child's descriptors laid out from a [`ChildFd`] map.
//!
//! Everything the child needs is allocated before `fork`; between `fork`
//! and `exec` the child only makes raw syscalls.

use std::ffi::{CString, OsStr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use crate::config::{ChildFd, SpawnConfig};
use crate::error::{TransportError, errno, errno_name};
use crate::socket::set_nonblocking_fd;

/// The parent's end of the pipe behind one child descriptor.
pub(crate) struct ParentEnd {
	pub(crate) child_fd: RawFd,
	pub(crate) to_child: bool,
	pub(crate) fd: OwnedFd,
}

/// A freshly started child and the parent's ends of its pipes.
pub(crate) struct Child {
	pub(crate) pid: i32,
	pub(crate) pipes: Vec<ParentEnd>,
}

/// `source` must end up as the child's `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
	target: libc::c_int,
	source: libc::c_int,
}

/// `(read end, write end)`, both close-on-exec.
fn pipe() -> Result<(OwnedFd, OwnedFd), TransportError> {
	let mut fds = [0; 2];
	if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
		return Err(TransportError::Spawn { errno: errno() });
	}
	Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn c_string(value: &OsStr) -> Result<CString, TransportError> {
	CString::new(value.as_bytes()).map_err(|_| TransportError::InvalidArgument {
		reason: "interior NUL byte",
	})
}

/// NULL-terminated pointer table over `strings`, which must outlive it.
fn pointers(strings: &[CString]) -> Vec<*const libc::c_char> {
	strings.iter().map(|s| s.as_ptr()).chain(std::iter::once(ptr::null())).collect()
}

/// Everything the child touches after `fork`, prepared up front.
struct ExecPlan {
	program: CString,
	argv: Vec<CString>,
	envp: Option<Vec<CString>>,
	cwd: Option<CString>,
	uid: Option<libc::uid_t>,
	gid: Option<libc::gid_t>,
	banner: Vec<u8>,
}

impl ExecPlan {
	fn new(config: &SpawnConfig) -> Result<Self, TransportError> {
		let program = c_string(config.program.as_os_str())?;
		let argv = config.args.iter().map(|a| c_string(a)).collect::<Result<Vec<_>, _>>()?;
		if argv.is_empty() {
			return Err(TransportError::InvalidArgument {
				reason: "empty argument list",
			});
		}
		let envp = match &config.env {
			Some(env) => Some(
				env.iter()
					.map(|(key, value)| {
						let mut pair = key.clone();
						pair.push("=");
						pair.push(value);
						c_string(&pair)
					})
					.collect::<Result<Vec<_>, _>>()?,
			),
			None => None,
		};
		let cwd = config.cwd.as_ref().map(|dir| c_string(dir.as_os_str())).transpose()?;

		let mut banner = b"cannot run ".to_vec();
		banner.extend_from_slice(config.program.as_os_str().as_bytes());
		banner.extend_from_slice(b": ");

		Ok(Self {
			program,
			argv,
			envp,
			cwd,
			uid: config.uid,
			gid: config.gid,
			banner,
		})
	}
}

/// Writes `<banner><stage>: <ERRNO>\n` to the child's stderr and exits.
///
/// # Safety
/// Only call in the forked child.
unsafe fn child_fail(banner: &[u8], stage: &str) -> ! {
	let name = errno_name(errno());
	let parts: [&[u8]; 5] = [banner, stage.as_bytes(), b": ", name.as_bytes(), b"\n"];
	for part in parts {
		unsafe { libc::write(2, part.as_ptr() as *const libc::c_void, part.len()) };
	}
	unsafe { libc::_exit(1) }
}

/// Puts every source at its target.
///
/// Sources are first copied above `floor` (past every target), so no
/// `dup2` can overwrite a source another placement still needs. A source
/// already sitting on its target only loses `FD_CLOEXEC`.
///
/// # Safety
/// Only call in the forked child.
unsafe fn place_fds(banner: &[u8], placements: &mut [Placement], floor: libc::c_int) {
	unsafe {
		for placement in placements.iter_mut() {
			if placement.source != placement.target {
				let moved = libc::fcntl(placement.source, libc::F_DUPFD_CLOEXEC, floor);
				if moved == -1 {
					child_fail(banner, "dup");
				}
				placement.source = moved;
			}
		}
		for placement in placements.iter() {
			let rc = if placement.source == placement.target {
				libc::fcntl(placement.target, libc::F_SETFD, 0)
			} else {
				libc::dup2(placement.source, placement.target)
			};
			if rc == -1 {
				child_fail(banner, "dup2");
			}
		}
	}
}

/// Child side of the fork. Never returns.
///
/// # Safety
/// Only call in the forked child; makes no allocations.
unsafe fn exec_child(
	plan: &ExecPlan,
	argv: &[*const libc::c_char],
	envp: Option<&[*const libc::c_char]>,
	placements: &mut [Placement],
	floor: libc::c_int,
	unmapped: &[libc::c_int],
) -> ! {
	unsafe {
		// the parent ignores SIGPIPE; the child gets the default back
		libc::signal(libc::SIGPIPE, libc::SIG_DFL);
		place_fds(&plan.banner, placements, floor);
		for &fd in unmapped {
			libc::close(fd);
		}
		if let Some(cwd) = &plan.cwd {
			if libc::chdir(cwd.as_ptr()) == -1 {
				child_fail(&plan.banner, "chdir");
			}
		}
		if let Some(gid) = plan.gid {
			if libc::setgroups(1, &gid) == -1 || libc::setgid(gid) == -1 {
				child_fail(&plan.banner, "setgid");
			}
		}
		if let Some(uid) = plan.uid {
			if libc::setuid(uid) == -1 {
				child_fail(&plan.banner, "setuid");
			}
		}
		match envp {
			Some(envp) => libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
			None => libc::execv(plan.program.as_ptr(), argv.as_ptr()),
		};
		child_fail(&plan.banner, "exec")
	}
}

/// Starts `config.program` with its descriptors laid out per
/// `config.child_fds`, creating a pipe for every `ToChild`/`FromChild` entry.
///
/// Launch failures after the fork (bad path, chdir, privilege drop) do not
/// surface here: the child reports them on its stderr and exits with 1.
pub(crate) fn spawn(config: &SpawnConfig) -> Result<Child, TransportError> {
	let plan = ExecPlan::new(config)?;
	let argv = pointers(&plan.argv);
	let envp = plan.envp.as_deref().map(pointers);

	let mut placements = Vec::with_capacity(config.child_fds.len());
	let mut child_ends = Vec::new();
	let mut pipes = Vec::new();
	for (&target, &kind) in &config.child_fds {
		if target < 0 {
			return Err(TransportError::InvalidArgument {
				reason: "negative child descriptor",
			});
		}
		let source = match kind {
			ChildFd::ToChild => {
				let (read, write) = pipe()?;
				let source = read.as_raw_fd();
				child_ends.push(read);
				pipes.push(ParentEnd {
					child_fd: target,
					to_child: true,
					fd: write,
				});
				source
			}
			ChildFd::FromChild => {
				let (read, write) = pipe()?;
				let source = write.as_raw_fd();
				child_ends.push(write);
				pipes.push(ParentEnd {
					child_fd: target,
					to_child: false,
					fd: read,
				});
				source
			}
			ChildFd::Inherit(fd) if fd >= 0 => fd,
			ChildFd::Inherit(_) => {
				return Err(TransportError::InvalidArgument {
					reason: "negative inherited descriptor",
				});
			}
		};
		placements.push(Placement { target, source });
	}
	let floor = config
		.child_fds
		.keys()
		.next_back()
		.map_or(3, |&highest| highest.saturating_add(1).max(3));
	let unmapped: Vec<libc::c_int> = (0..3).filter(|fd| !config.child_fds.contains_key(fd)).collect();

	let pid = unsafe { libc::fork() };
	if pid == -1 {
		return Err(TransportError::Spawn { errno: errno() });
	}
	if pid == 0 {
		unsafe { exec_child(&plan, &argv, envp.as_deref(), &mut placements, floor, &unmapped) }
	}

	drop(child_ends);
	for end in &pipes {
		set_nonblocking_fd(end.fd.as_raw_fd(), true).map_err(|e| TransportError::Spawn { errno: e.errno() })?;
	}
	Ok(Child { pid, pipes })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plan_rejects_interior_nul() {
		let config = SpawnConfig::new("/bin/echo").arg("a\0b");
		assert!(matches!(
			ExecPlan::new(&config),
			Err(TransportError::InvalidArgument { .. })
		));
	}

	#[test]
	fn plan_formats_environment_pairs() {
		let config = SpawnConfig::new("/bin/env").env("A", "1");
		let plan = ExecPlan::new(&config).unwrap();
		assert_eq!(plan.envp.unwrap(), vec![CString::new("A=1").unwrap()]);
		assert!(plan.banner.starts_with(b"cannot run /bin/env"));
	}

	#[test]
	fn negative_descriptors_are_refused_before_fork() {
		let config = SpawnConfig::new("/bin/true").child_fd(-1, ChildFd::FromChild);
		assert!(matches!(spawn(&config), Err(TransportError::InvalidArgument { .. })));

		let config = SpawnConfig::new("/bin/true").child_fd(3, ChildFd::Inherit(-5));
		assert!(matches!(spawn(&config), Err(TransportError::InvalidArgument { .. })));
	}
}
