//! Starting a job's program inside fresh namespaces.
//!
//! The process tree looks like this:
//!
//! ```text
//! worker ── helper (new user ns, maps ids, owns the new PID ns)
//!              └── init (PID 1: mounts, pivot_root, rlimits, exec of the job's program)
//! ```
//!
//! The helper is what the worker spawns and waits on. It mirrors init's exit status
//! and kills init through `PR_SET_PDEATHSIG` if it dies, which takes the whole PID
//! namespace with it. Everything between fork and exec runs without allocating; all
//! strings are prepared up front in a [`LaunchPlan`].
//!
//! A failing setup step writes `(stage, errno)` to a close-on-exec pipe, so an empty
//! pipe after spawning means the program was exec'd.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Stdio;
use std::ptr;

use libc::{c_char, c_int, c_ulong};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::statvfs::{statvfs, FsFlags};
use tokio::process::{Child, Command};

use crate::spec::{JobMount, JobSpec};
use crate::worker::ExecutionError;

pub(crate) const NAMESPACES: c_int = libc::CLONE_NEWUSER
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWUTS;

/// Exit status of a process that failed before exec.
const SETUP_FAILED: c_int = 127;

/// Mount flags the kernel locks on mounts inherited into a user namespace; a remount
/// must repeat them.
const LOCKED_FLAGS: c_ulong = libc::MS_NOSUID
    | libc::MS_NODEV
    | libc::MS_NOEXEC
    | libc::MS_NOATIME
    | libc::MS_NODIRATIME
    | libc::MS_RELATIME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Unshare = 1,
    Setgroups,
    UidMap,
    GidMap,
    Fork,
    PrivateRoot,
    BindRoot,
    Mount,
    Loopback,
    Hostname,
    PivotRoot,
    ReadOnlyRoot,
    WorkingDirectory,
    Rlimit,
    SetGid,
    SetUid,
    Exec,
}

impl Stage {
    const ALL: [Stage; 17] = [
        Stage::Unshare,
        Stage::Setgroups,
        Stage::UidMap,
        Stage::GidMap,
        Stage::Fork,
        Stage::PrivateRoot,
        Stage::BindRoot,
        Stage::Mount,
        Stage::Loopback,
        Stage::Hostname,
        Stage::PivotRoot,
        Stage::ReadOnlyRoot,
        Stage::WorkingDirectory,
        Stage::Rlimit,
        Stage::SetGid,
        Stage::SetUid,
        Stage::Exec,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Unshare => "unshare",
            Stage::Setgroups => "setgroups",
            Stage::UidMap => "uid_map",
            Stage::GidMap => "gid_map",
            Stage::Fork => "fork",
            Stage::PrivateRoot => "make-root-private",
            Stage::BindRoot => "bind-root",
            Stage::Mount => "mount",
            Stage::Loopback => "loopback",
            Stage::Hostname => "hostname",
            Stage::PivotRoot => "pivot-root",
            Stage::ReadOnlyRoot => "read-only-root",
            Stage::WorkingDirectory => "working-directory",
            Stage::Rlimit => "rlimit",
            Stage::SetGid => "setgid",
            Stage::SetUid => "setuid",
            Stage::Exec => "exec",
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| *stage as u8 == raw)
    }
}

/// Decode what a failed setup step wrote to the report pipe.
fn decode_failure(report: &[u8]) -> Option<(Stage, Errno)> {
    let [stage, a, b, c, d] = *report else {
        return None;
    };
    let stage = Stage::from_u8(stage)?;
    Some((stage, Errno::from_raw(i32::from_ne_bytes([a, b, c, d]))))
}

/// NUL-terminated pointer array over owned C strings.
struct CStringArray {
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

impl CStringArray {
    fn new(strings: Vec<CString>) -> Self {
        let mut pointers: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        pointers.push(ptr::null());
        Self {
            _strings: strings,
            pointers,
        }
    }

    fn as_ptr(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }
}

// SAFETY: the pointers refer into the heap buffers of `_strings`, which are owned by
// the same value and never mutated or moved out.
unsafe impl Send for CStringArray {}
unsafe impl Sync for CStringArray {}

enum PlannedMount {
    Bind {
        source: CString,
        target: CString,
        read_only: bool,
        locked: c_ulong,
    },
    Tmp {
        target: CString,
    },
    Proc {
        target: CString,
    },
}

/// Everything the forked processes need, prepared before forking.
pub struct LaunchPlan {
    root: CString,
    mounts: Vec<PlannedMount>,
    hostname: CString,
    working_directory: CString,
    program: CString,
    argv: CStringArray,
    envp: CStringArray,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    uid: libc::uid_t,
    gid: libc::gid_t,
    memory_bytes: Option<u64>,
    cpu_seconds: Option<u64>,
    enable_loopback: bool,
    read_only_root: bool,
    root_locked: c_ulong,
}

fn cstring(what: &str, bytes: impl Into<Vec<u8>>) -> Result<CString, ExecutionError> {
    CString::new(bytes).map_err(|_| ExecutionError::setup("prepare", format!("{what} contains a NUL byte")))
}

fn path_cstring(what: &str, path: &Path) -> Result<CString, ExecutionError> {
    cstring(what, path.as_os_str().as_bytes())
}

fn locked_flags(path: &Path) -> Result<c_ulong, ExecutionError> {
    let stat = statvfs(path)
        .map_err(|e| ExecutionError::setup("prepare", format!("statvfs {}: {e}", path.display())))?;
    let flags = stat.flags();
    let mut locked = 0;
    for (flag, bit) in [
        (FsFlags::ST_NOSUID, libc::MS_NOSUID),
        (FsFlags::ST_NODEV, libc::MS_NODEV),
        (FsFlags::ST_NOEXEC, libc::MS_NOEXEC),
        (FsFlags::ST_NOATIME, libc::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, libc::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if flags.contains(flag) {
            locked |= bit;
        }
    }
    Ok(locked & LOCKED_FLAGS)
}

impl LaunchPlan {
    pub fn new(spec: &JobSpec, root: &Path, hostname: &str) -> Result<Self, ExecutionError> {
        let in_root = |target: &str| root.join(target.trim_start_matches('/'));

        let mut mounts = Vec::with_capacity(spec.mounts.len());
        for mount in &spec.mounts {
            mounts.push(match mount {
                JobMount::Bind {
                    source,
                    target,
                    read_only,
                } => PlannedMount::Bind {
                    source: cstring("bind source", source.as_str())?,
                    target: path_cstring("mount target", &in_root(target))?,
                    read_only: *read_only,
                    locked: if *read_only {
                        locked_flags(Path::new(source))?
                    } else {
                        0
                    },
                },
                JobMount::Tmp { target } => PlannedMount::Tmp {
                    target: path_cstring("mount target", &in_root(target))?,
                },
                JobMount::Proc { target } => PlannedMount::Proc {
                    target: path_cstring("mount target", &in_root(target))?,
                },
            });
        }

        let program = cstring("program", spec.program.as_str())?;
        let mut argv = vec![program.clone()];
        for arg in &spec.arguments {
            argv.push(cstring("argument", arg.as_str())?);
        }
        let mut envp = Vec::with_capacity(spec.environment.len());
        for (key, value) in &spec.environment {
            envp.push(cstring("environment", format!("{key}={value}"))?);
        }

        let outer_uid = nix::unistd::geteuid().as_raw();
        let outer_gid = nix::unistd::getegid().as_raw();

        Ok(Self {
            root: path_cstring("root", root)?,
            mounts,
            hostname: cstring("hostname", hostname)?,
            working_directory: cstring("working directory", spec.working_directory.as_str())?,
            program,
            argv: CStringArray::new(argv),
            envp: CStringArray::new(envp),
            uid_map: format!("{} {} 1\n", spec.user, outer_uid).into_bytes(),
            gid_map: format!("{} {} 1\n", spec.group, outer_gid).into_bytes(),
            uid: spec.user,
            gid: spec.group,
            memory_bytes: spec.limits.memory_bytes,
            cpu_seconds: spec.limits.cpu_seconds,
            enable_loopback: spec.enable_loopback,
            read_only_root: !spec.writable_root,
            root_locked: locked_flags(root)?,
        })
    }
}

/// Read the helper's failure record until every write end is closed. The wait lasts
/// as long as namespace and mount setup, so it runs on the blocking pool.
async fn read_report(fd: OwnedFd) -> Result<Vec<u8>, ExecutionError> {
    tokio::task::spawn_blocking(move || {
        let mut report = Vec::new();
        File::from(fd).read_to_end(&mut report).map(|_| report)
    })
    .await
    .map_err(|e| ExecutionError::Internal(format!("setup report reader: {e}")))?
    .map_err(|e| ExecutionError::Internal(format!("reading setup report: {e}")))
}

/// Spawn the job. Returns the helper process once the program has been exec'd, or
/// the setup stage that failed.
pub async fn launch(plan: LaunchPlan) -> Result<Child, ExecutionError> {
    let (report_read, report_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| ExecutionError::setup("prepare", format!("pipe: {e}")))?;
    let report_fd = report_write.as_raw_fd();

    // Never exec'd: the helper exits from the pre-exec hook.
    let mut command = Command::new("/proc/self/exe");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: the hook only makes async-signal-safe libc calls on data prepared above.
    unsafe {
        command.pre_exec(move || unsafe { helper(&plan, report_fd) });
    }

    // Returns once init has exec'd or exited: both hold std's own close-on-exec pipe.
    let spawned = command.spawn();
    drop(report_write);
    let mut child = spawned.map_err(|e| ExecutionError::setup("spawn", e.to_string()))?;

    let report = read_report(report_read).await?;
    if report.is_empty() {
        return Ok(child);
    }

    let _ = child.wait().await;
    Err(match decode_failure(&report) {
        Some((stage, errno)) => ExecutionError::setup(stage.name(), errno_message(errno)),
        None => ExecutionError::Internal(format!("malformed setup report {report:?}")),
    })
}

fn errno_message(errno: Errno) -> String {
    format!("{} ({errno:?})", errno.desc())
}

// ---------------------------------------------------------------------------
// Between fork and exec. No allocation, no locks.
// ---------------------------------------------------------------------------

fn errno() -> i32 {
    Errno::last_raw()
}

unsafe fn report(fd: RawFd, stage: Stage, errno: i32) -> ! {
    let mut record = [0u8; 5];
    record[0] = stage as u8;
    record[1..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(fd, record.as_ptr().cast(), record.len());
    libc::_exit(SETUP_FAILED)
}

macro_rules! check {
    ($fd:expr, $stage:expr, $call:expr) => {
        if $call < 0 {
            report($fd, $stage, errno());
        }
    };
}

/// Write `contents` to the NUL-terminated `path` in a single write.
pub(crate) unsafe fn write_file(path: &[u8], contents: &[u8]) -> Result<(), i32> {
    let fd = libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC);
    if fd < 0 {
        return Err(errno());
    }
    let written = loop {
        let n = libc::write(fd, contents.as_ptr().cast(), contents.len());
        if n < 0 && errno() == libc::EINTR {
            continue;
        }
        break n;
    };
    let result = if written < 0 {
        Err(errno())
    } else if written as usize != contents.len() {
        Err(libc::EIO)
    } else {
        Ok(())
    };
    libc::close(fd);
    result
}

/// Enter the new user namespace and map the job's ids onto ours.
pub(crate) unsafe fn map_ids(uid_map: &[u8], gid_map: &[u8]) -> Result<(), (Stage, i32)> {
    if libc::unshare(NAMESPACES) != 0 {
        return Err((Stage::Unshare, errno()));
    }
    write_file(b"/proc/self/setgroups\0", b"deny").map_err(|e| (Stage::Setgroups, e))?;
    write_file(b"/proc/self/uid_map\0", uid_map).map_err(|e| (Stage::UidMap, e))?;
    write_file(b"/proc/self/gid_map\0", gid_map).map_err(|e| (Stage::GidMap, e))?;
    Ok(())
}

unsafe fn helper(plan: &LaunchPlan, fd: RawFd) -> ! {
    if let Err((stage, errno)) = map_ids(&plan.uid_map, &plan.gid_map) {
        report(fd, stage, errno);
    }

    let pid = libc::fork();
    if pid < 0 {
        report(fd, Stage::Fork, errno());
    }
    if pid == 0 {
        init(plan, fd);
    }

    // Drop our copies of every pipe but stdout/stderr so the worker sees EOF as soon
    // as init has exec'd.
    close_from(3);

    let status = loop {
        let mut status: c_int = 0;
        let waited = libc::waitpid(pid, &mut status, 0);
        if waited == pid {
            break status;
        }
        if waited < 0 && errno() != libc::EINTR {
            libc::_exit(SETUP_FAILED);
        }
    };

    if libc::WIFEXITED(status) {
        libc::_exit(libc::WEXITSTATUS(status));
    }
    let signal = libc::WTERMSIG(status);
    let no_core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    libc::setrlimit(libc::RLIMIT_CORE, &no_core);
    libc::signal(signal, libc::SIG_DFL);
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigaddset(&mut set, signal);
    libc::sigprocmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    libc::kill(libc::getpid(), signal);
    libc::_exit(128 + signal)
}

unsafe fn close_from(first: c_int) {
    if libc::syscall(libc::SYS_close_range, first as libc::c_uint, libc::c_uint::MAX, 0) == 0 {
        return;
    }
    let mut limit: libc::rlimit = std::mem::zeroed();
    let max = if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
        limit.rlim_cur.min(65_536) as c_int
    } else {
        1024
    };
    for fd in first..max {
        libc::close(fd);
    }
}

unsafe fn mount(source: *const c_char, target: *const c_char, fstype: *const c_char, flags: c_ulong) -> c_int {
    libc::mount(source, target, fstype, flags, ptr::null())
}

fn rlimit(value: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    }
}

unsafe fn loopback_up() -> Result<(), i32> {
    let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
    if sock < 0 {
        return Err(errno());
    }
    let mut request: libc::ifreq = std::mem::zeroed();
    for (dst, src) in request.ifr_name.iter_mut().zip(b"lo") {
        *dst = *src as c_char;
    }
    let mut result = Ok(());
    if libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut request as *mut libc::ifreq) < 0 {
        result = Err(errno());
    } else {
        request.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        if libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &request as *const libc::ifreq) < 0 {
            result = Err(errno());
        }
    }
    libc::close(sock);
    result
}

unsafe fn init(plan: &LaunchPlan, fd: RawFd) -> ! {
    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as c_ulong, 0, 0, 0);

    let root = plan.root.as_ptr();
    check!(
        fd,
        Stage::PrivateRoot,
        mount(ptr::null(), b"/\0".as_ptr().cast(), ptr::null(), libc::MS_REC | libc::MS_PRIVATE)
    );
    check!(
        fd,
        Stage::BindRoot,
        mount(root, root, ptr::null(), libc::MS_BIND | libc::MS_REC)
    );

    for planned in &plan.mounts {
        match planned {
            PlannedMount::Bind {
                source,
                target,
                read_only,
                locked,
            } => {
                check!(
                    fd,
                    Stage::Mount,
                    mount(source.as_ptr(), target.as_ptr(), ptr::null(), libc::MS_BIND | libc::MS_REC)
                );
                if *read_only {
                    check!(
                        fd,
                        Stage::Mount,
                        mount(
                            ptr::null(),
                            target.as_ptr(),
                            ptr::null(),
                            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | locked
                        )
                    );
                }
            }
            PlannedMount::Tmp { target } => check!(
                fd,
                Stage::Mount,
                mount(
                    b"tmpfs\0".as_ptr().cast(),
                    target.as_ptr(),
                    b"tmpfs\0".as_ptr().cast(),
                    libc::MS_NOSUID | libc::MS_NODEV
                )
            ),
            PlannedMount::Proc { target } => check!(
                fd,
                Stage::Mount,
                mount(
                    b"proc\0".as_ptr().cast(),
                    target.as_ptr(),
                    b"proc\0".as_ptr().cast(),
                    libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC
                )
            ),
        }
    }

    if plan.enable_loopback {
        if let Err(errno) = loopback_up() {
            report(fd, Stage::Loopback, errno);
        }
    }
    check!(
        fd,
        Stage::Hostname,
        libc::sethostname(plan.hostname.as_ptr(), plan.hostname.as_bytes().len())
    );

    check!(fd, Stage::PivotRoot, libc::chdir(root));
    let dot: *const c_char = b".\0".as_ptr().cast();
    check!(
        fd,
        Stage::PivotRoot,
        libc::syscall(libc::SYS_pivot_root, dot, dot) as c_int
    );
    check!(fd, Stage::PivotRoot, libc::umount2(dot, libc::MNT_DETACH));
    check!(fd, Stage::PivotRoot, libc::chdir(b"/\0".as_ptr().cast()));

    if plan.read_only_root {
        check!(
            fd,
            Stage::ReadOnlyRoot,
            mount(
                ptr::null(),
                b"/\0".as_ptr().cast(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | plan.root_locked
            )
        );
    }
    check!(
        fd,
        Stage::WorkingDirectory,
        libc::chdir(plan.working_directory.as_ptr())
    );

    if let Some(bytes) = plan.memory_bytes {
        check!(fd, Stage::Rlimit, libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes)));
    }
    if let Some(seconds) = plan.cpu_seconds {
        check!(fd, Stage::Rlimit, libc::setrlimit(libc::RLIMIT_CPU, &rlimit(seconds)));
    }

    check!(fd, Stage::SetGid, libc::setresgid(plan.gid, plan.gid, plan.gid));
    check!(fd, Stage::SetUid, libc::setresuid(plan.uid, plan.uid, plan.uid));

    libc::execve(plan.program.as_ptr(), plan.argv.as_ptr(), plan.envp.as_ptr());
    report(fd, Stage::Exec, errno())
}
