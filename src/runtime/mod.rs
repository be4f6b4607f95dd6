//! Sandbox launcher
//!
//! Given a staged root filesystem and an image header, launch the image's
//! command inside a fresh isolation domain and report its exit status.
//!
//! The launcher is a state machine over two processes. The outer process
//! enters the user namespace first (so no host root is needed for the
//! rest), writes its identity maps, detaches into the remaining
//! namespaces and forks. The inner process is PID 1 of the new PID
//! namespace; it installs cgroup limits, pivots into the rootfs, mounts
//! the virtual filesystems and execs the target. The outer process only
//! forwards signals and the child's exit status.

mod cgroup;
mod idmap;
mod mount;

use crate::error::{Error, Result};
use crate::image::ImageHeader;
use nix::{
    errno::Errno,
    sched::{unshare, CloneFlags},
    sys::{
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{chdir, execve, fork, getgid, getuid, sethostname, setpgid, ForkResult, Pid},
};
use std::{
    collections::BTreeMap,
    ffi::CString,
    path::Path,
    sync::atomic::{AtomicI32, Ordering},
};
use uuid::Uuid;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Marker injected into every container environment.
const MARKER_VAR: &str = "NSBOX_CONTAINER";
/// Linux HOST_NAME_MAX.
const HOSTNAME_MAX: usize = 63;
const SIGNAL_GRACE_SECS: u32 = 2;

/// Exit status of an inner process that failed before exec.
const EXIT_SETUP_FAILED: i32 = 126;
/// Exit status of an inner process whose exec failed.
const EXIT_EXEC_FAILED: i32 = 127;

/// Caller-side knobs for one `run` invocation.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Container id; synthesised when absent. Doubles as the UTS hostname
    /// and the cgroup leaf name.
    pub container_id: Option<String>,
    /// Opaque limit string written to `memory.max` (byte count or `max`).
    pub memory_limit: Option<String>,
    /// Environment overrides; win over the image's `runtime.env`.
    pub env: Vec<(String, String)>,
}

/// Parse `KEY=VALUE` override arguments; malformed entries are reported
/// and skipped.
pub fn parse_env_overrides(args: &[String]) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|arg| match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                Some((key.to_string(), value.to_string()))
            }
            _ => {
                log::warn!("ignoring malformed environment override `{}`", arg);
                None
            }
        })
        .collect()
}

/// Launch `header.runtime.cmd` inside a new isolation domain rooted at
/// `rootfs`, inheriting the caller's stdio. Returns the child's exit
/// code, with death-by-signal mapped to `128 + signo`.
pub fn run(rootfs: &Path, header: &ImageHeader, opts: &RunOptions) -> Result<i32> {
    if header.runtime.cmd.is_empty() {
        return Err(Error::MissingField("runtime.cmd"));
    }
    // pivot_root and the self-bind need an absolute path
    let rootfs = rootfs.canonicalize()?;
    let container_id = opts
        .container_id
        .clone()
        .unwrap_or_else(synthesize_container_id);
    let hostname = truncate_hostname(&container_id);

    // Stage U: the user namespace comes first so everything after it runs
    // with namespace-root capabilities instead of host root.
    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| Error::Namespace {
        what: "user",
        source: e,
    })?;
    idmap::write_identity_maps(uid, gid)?;

    // Stage N: the PID namespace only takes effect at the next fork.
    unshare(
        CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWCGROUP,
    )
    .map_err(|e| Error::Namespace {
        what: "pid/mount/uts/ipc/cgroup",
        source: e,
    })?;
    sethostname(&hostname).map_err(Error::Hostname)?;

    // Stage F
    // SAFETY: single-threaded at this point; the child only calls
    // async-signal-safe operations or execs.
    match unsafe { fork() }.map_err(|e| Error::Namespace {
        what: "pid (fork)",
        source: e,
    })? {
        ForkResult::Parent { child } => {
            // both sides set the group so a signal arriving before the
            // child has run cannot hit the outer's own group
            let _ = setpgid(child, child);
            let code = outer_wait(child);
            cgroup::teardown(&container_id);
            code
        }
        ForkResult::Child => {
            let code = match inner_main(&rootfs, header, opts, &container_id, &hostname) {
                Err(e @ Error::Exec { .. }) => {
                    log::error!("{}", e);
                    EXIT_EXEC_FAILED
                }
                Err(e) => {
                    log::error!("{}", e);
                    EXIT_SETUP_FAILED
                }
                Ok(never) => match never {},
            };
            std::process::exit(code);
        }
    }
}

/// Everything past the fork; runs as PID 1 of the new PID namespace and
/// either execs or exits non-zero.
fn inner_main(
    rootfs: &Path,
    header: &ImageHeader,
    opts: &RunOptions,
    container_id: &str,
    hostname: &str,
) -> Result<std::convert::Infallible> {
    // own process group, so the outer can signal the whole container
    if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        log::warn!("could not create process group: {}", e);
    }

    // Stage C: all best-effort
    cgroup::enter(container_id, opts.memory_limit.as_deref());

    // Stage R. pivot_root re-points every process in the mount namespace,
    // so the inner detaches into a nested one; the outer keeps the host
    // view it needs for teardown.
    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| Error::Namespace {
        what: "mount (inner)",
        source: e,
    })?;
    mount::pivot(rootfs)?;

    // Stage M
    mount::mount_virtual_filesystems()?;

    // Stage W
    let work_dir = header.runtime.work_dir.as_deref().unwrap_or("/");
    chdir(Path::new(work_dir)).map_err(|e| Error::Chdir {
        path: work_dir.into(),
        source: e,
    })?;

    // Stage E
    let env = build_env_map(&header.runtime.env, &opts.env, hostname);
    exec(&header.runtime.cmd, &env)
}

/// Assemble the container environment: image env, then caller overrides,
/// then the guaranteed variables. The inherited environment is discarded
/// entirely.
fn build_env_map(
    image_env: &BTreeMap<String, String>,
    overrides: &[(String, String)],
    hostname: &str,
) -> BTreeMap<String, String> {
    let mut env = image_env.clone();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    env.insert("HOSTNAME".to_string(), hostname.to_string());
    env.insert(MARKER_VAR.to_string(), "1".to_string());
    env
}

fn exec(cmd: &[String], env: &BTreeMap<String, String>) -> Result<std::convert::Infallible> {
    let program = CString::new(cmd[0].as_str())?;
    let argv = cmd
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let envp = env
        .iter()
        .map(|(key, value)| CString::new(format!("{}={}", key, value)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let errno = match execve(&program, &argv, &envp) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    Err(Error::Exec {
        program: cmd[0].clone(),
        source: errno,
    })
}

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Forward a termination request to the container's process group; a
/// pending alarm escalates to SIGKILL once the grace period runs out.
/// Only async-signal-safe calls are allowed here.
extern "C" fn forward_signal(signo: libc::c_int) {
    let child = CHILD_PID.load(Ordering::Relaxed);
    if child <= 0 {
        return;
    }
    unsafe {
        if signo == libc::SIGALRM {
            libc::kill(-child, libc::SIGKILL);
        } else {
            libc::kill(-child, libc::SIGTERM);
            libc::alarm(SIGNAL_GRACE_SECS);
        }
    }
}

/// Reap the inner process, translating its wait status into the exit code
/// contract.
fn outer_wait(child: Pid) -> Result<i32> {
    CHILD_PID.store(child.as_raw(), Ordering::Relaxed);
    install_forwarding_handlers();

    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code(&status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Wait(e)),
        }
    }
}

fn install_forwarding_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGALRM] {
        // SAFETY: the handler only touches atomics and signal-safe libc
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            log::warn!("could not install {} forwarding: {}", signal, e);
        }
    }
}

/// `None` while the child is merely stopped or continued.
fn exit_code(status: &WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + *signal as i32),
        _ => None,
    }
}

fn synthesize_container_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("nsbox-{}", &uuid[..8])
}

/// UTS hostnames are capped at 63 bytes; cut on a char boundary.
fn truncate_hostname(id: &str) -> String {
    if id.len() <= HOSTNAME_MAX {
        return id.to_string();
    }
    let mut end = HOSTNAME_MAX;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    id[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_win_over_image() {
        let mut image_env = BTreeMap::new();
        image_env.insert("MODE".to_string(), "image".to_string());
        image_env.insert("KEEP".to_string(), "yes".to_string());
        let overrides = vec![("MODE".to_string(), "caller".to_string())];

        let env = build_env_map(&image_env, &overrides, "box");
        assert_eq!(env["MODE"], "caller");
        assert_eq!(env["KEEP"], "yes");
        assert_eq!(env["PATH"], DEFAULT_PATH);
        assert_eq!(env["HOSTNAME"], "box");
        assert_eq!(env[MARKER_VAR], "1");
    }

    #[test]
    fn image_path_is_not_clobbered() {
        let mut image_env = BTreeMap::new();
        image_env.insert("PATH".to_string(), "/opt/bin".to_string());
        let env = build_env_map(&image_env, &[], "box");
        assert_eq!(env["PATH"], "/opt/bin");
    }

    #[test]
    fn caller_environment_is_not_inherited() {
        std::env::set_var("NSBOX_TEST_LEAK", "1");
        let env = build_env_map(&BTreeMap::new(), &[], "box");
        assert!(!env.contains_key("NSBOX_TEST_LEAK"));
    }

    #[test]
    fn malformed_overrides_are_skipped() {
        let args = vec![
            "GOOD=1".to_string(),
            "NO_EQUALS".to_string(),
            "=empty-key".to_string(),
            "ALSO=with=equals".to_string(),
        ];
        let parsed = parse_env_overrides(&args);
        assert_eq!(
            parsed,
            vec![
                ("GOOD".to_string(), "1".to_string()),
                ("ALSO".to_string(), "with=equals".to_string()),
            ]
        );
    }

    #[test]
    fn exit_code_translation() {
        let pid = Pid::from_raw(2);
        assert_eq!(exit_code(&WaitStatus::Exited(pid, 0)), Some(0));
        assert_eq!(exit_code(&WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code(&WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(143)
        );
        assert_eq!(
            exit_code(&WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_code(&WaitStatus::StillAlive), None);
    }

    #[test]
    fn hostname_is_truncated_to_63_bytes() {
        let long = "a".repeat(80);
        let truncated = truncate_hostname(&long);
        assert_eq!(truncated.len(), 63);

        // multi-byte char straddling the limit is dropped entirely
        let tricky = format!("{}é", "a".repeat(62));
        let truncated = truncate_hostname(&tricky);
        assert_eq!(truncated.len(), 62);

        assert_eq!(truncate_hostname("short"), "short");
    }

    #[test]
    fn synthesized_ids_are_distinct() {
        let a = synthesize_container_id();
        let b = synthesize_container_id();
        assert!(a.starts_with("nsbox-"));
        assert_eq!(a.len(), "nsbox-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn missing_cmd_is_rejected_before_any_namespace_work() {
        let header: ImageHeader =
            serde_json::from_str(r#"{ "imageName": "n", "version": "1" }"#).unwrap();
        let result = run(Path::new("/nonexistent"), &header, &RunOptions::default());
        assert!(matches!(result, Err(Error::MissingField("runtime.cmd"))));
    }
}
