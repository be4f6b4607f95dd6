//! cgroup v2 resource limits under the unified hierarchy

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PARENT: &str = "nsbox";

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const TEARDOWN_POLL: Duration = Duration::from_millis(50);

/// Leaf directory owned by one container.
pub fn leaf_dir(id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(PARENT).join(id)
}

/// Create the leaf, apply the memory limit and move the calling process
/// into it.
///
/// Every failure here degrades to a warning: delegated cgroup write
/// access is environment-dependent and a container without limits is
/// still worth running.
pub fn enter(id: &str, memory_limit: Option<&str>) {
    let leaf = leaf_dir(id);
    if let Err(e) = fs::create_dir_all(&leaf) {
        log::warn!("could not create cgroup {}: {}", leaf.display(), e);
        return;
    }

    if let Some(limit) = memory_limit {
        // passed through verbatim; the kernel documents the grammar
        if let Err(e) = fs::write(leaf.join("memory.max"), limit) {
            log::warn!("could not set memory.max={} on {}: {}", limit, leaf.display(), e);
        }
    }

    // the kernel resolves the written pid in the writer's pid namespace
    let pid = nix::unistd::getpid();
    if let Err(e) = fs::write(leaf.join("cgroup.procs"), pid.to_string()) {
        log::warn!("could not join cgroup {}: {}", leaf.display(), e);
    }
}

/// Remove the leaf after the container exited.
///
/// The kernel refuses the rmdir until it has released every task, which
/// can lag the wait() return, so removal is retried briefly and finally
/// downgraded to a warning.
pub fn teardown(id: &str) {
    let leaf = leaf_dir(id);
    if !leaf.exists() {
        return;
    }
    let deadline = Instant::now() + TEARDOWN_TIMEOUT;
    loop {
        match fs::remove_dir(&leaf) {
            Ok(()) => return,
            Err(_) if Instant::now() < deadline => thread::sleep(TEARDOWN_POLL),
            Err(e) => {
                log::warn!("could not remove cgroup {}: {}", leaf.display(), e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_sits_under_the_tool_parent() {
        assert_eq!(
            leaf_dir("nsbox-1234abcd"),
            Path::new("/sys/fs/cgroup/nsbox/nsbox-1234abcd")
        );
    }

    #[test]
    fn teardown_of_absent_leaf_is_quiet() {
        teardown("nsbox-does-not-exist");
    }
}
