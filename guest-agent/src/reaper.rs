//! Reaping for children the agent did not start.
//!
//! As PID 1 the agent inherits every orphaned process in the guest. Children
//! the agent spawns itself are tracked here and left to whoever holds their
//! `Child`; any other zombie child is collected by [`reap_orphans`].

use std::collections::BTreeSet;
use std::io;
use std::process::Child;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::kmsg;
use crate::process::SIGNALED_EXIT;

static OWNED: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

fn owned() -> MutexGuard<'static, BTreeSet<i32>> {
    OWNED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Spawn `proc` and keep the reaper away from it until [`forget`] is called.
pub fn spawn(proc: &mut std::process::Command) -> io::Result<Child> {
    // Held across the spawn so a child that exits at once is never seen
    // untracked.
    let mut owned = owned();
    let child = proc.spawn()?;
    owned.insert(child.id() as i32);
    Ok(child)
}

/// Stop tracking `pid`; call once its `Child` has been waited on.
pub fn forget(pid: u32) {
    owned().remove(&(pid as i32));
}

pub fn is_owned(pid: i32) -> bool {
    owned().contains(&pid)
}

/// Pid and state letter from a `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    // comm may hold spaces and parens; the fields after it do not.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Zombie children of this process, from /proc.
fn zombie_children() -> Vec<i32> {
    let me = std::process::id() as i32;
    let Ok(dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    dir.filter_map(|entry| {
        let pid: i32 = entry.ok()?.file_name().to_str()?.parse().ok()?;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        match parse_stat(&stat)? {
            ('Z', ppid) if ppid == me => Some(pid),
            _ => None,
        }
    })
    .collect()
}

/// Collect every exited child that is not tracked. Returns `(pid, exit)` for
/// each one reaped.
pub fn reap_orphans() -> Vec<(i32, i32)> {
    let owned = owned();
    let mut reaped = Vec::new();
    for pid in zombie_children() {
        if owned.contains(&pid) {
            continue;
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => reaped.push((pid, code)),
            Ok(WaitStatus::Signaled(..)) => reaped.push((pid, SIGNALED_EXIT)),
            Ok(_) => {}
            Err(e) => kmsg(&format!("reaper: waitpid({}) failed: {}", pid, e)),
        }
    }
    reaped
}

/// Reap orphans every `interval`, forever.
pub fn run_loop(interval: Duration) {
    loop {
        for (pid, exit) in reap_orphans() {
            kmsg(&format!("reaped orphan {} (exit {})", pid, exit));
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_now() -> std::process::Command {
        let mut proc = std::process::Command::new("/bin/sh");
        proc.args(["-c", "exit 3"]);
        proc
    }

    fn wait_for_zombie(pid: i32) {
        for _ in 0..200 {
            if zombie_children().contains(&pid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("{} never became a zombie", pid);
    }

    #[test]
    fn stat_line_with_odd_comm() {
        let stat = "4242 (a) b (c)) Z 1 4242 4242 0 -1";
        assert_eq!(parse_stat(stat), Some(('Z', 1)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn untracked_children_are_reaped() {
        let child = exit_now().spawn().unwrap();
        let pid = child.id() as i32;
        wait_for_zombie(pid);

        let reaped = reap_orphans();
        assert!(reaped.contains(&(pid, 3)), "reaped {:?}", reaped);
        assert!(!zombie_children().contains(&pid));
    }

    #[test]
    fn tracked_children_are_left_to_their_owner() {
        let mut child = spawn(&mut exit_now()).unwrap();
        let pid = child.id() as i32;
        assert!(is_owned(pid));
        wait_for_zombie(pid);

        assert!(!reap_orphans().iter().any(|(reaped, _)| *reaped == pid));
        assert_eq!(child.wait().unwrap().code(), Some(3));
        forget(child.id());
        assert!(!is_owned(pid));
    }
}
