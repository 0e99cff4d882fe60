//! Reaping of finished instance processes.
//!
//! The SIGCHLD handler only raises a flag; the poll loop calls `reap` when it
//! sees it. Nothing here runs in signal context.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::backend::ProvisioningBackend;
use crate::console;
use crate::instance::{Instance, Peer};
use crate::registry::Registry;
use crate::tty::drain_pty;

/// Exit status of `pid` if it has finished; signals map to `128 + signo`.
fn wait_nohang(pid: u32) -> Option<i32> {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
        Ok(_) => None,
        Err(Errno::ECHILD) => {
            warn!(pid, "child vanished before it was reaped");
            Some(-1)
        }
        Err(err) => {
            debug!(pid, error = %err, "waitpid failed");
            None
        }
    }
}

/// Reap every finished instance. Unattached instances are removed and torn
/// down; attached ones are marked dead and their console is woken so it can
/// deliver SESSION_DONE and finish the removal. Returns how many were reaped.
pub fn reap(registry: &Registry, backend: &dyn ProvisioningBackend) -> usize {
    let mut tails: Vec<(Peer, Vec<u8>)> = Vec::new();
    let mut wake: Vec<Peer> = Vec::new();
    let mut finished: Vec<Instance> = Vec::new();
    let mut reaped = 0;

    {
        let mut instances = registry.lock();
        let live: Vec<(String, u32)> = instances
            .iter()
            .filter(|inst| !inst.is_dead())
            .map(|inst| (inst.id.clone(), inst.pid))
            .collect();

        for (id, pid) in live {
            let Some(status) = wait_nohang(pid) else {
                continue;
            };
            let Some(inst) = instances.get_mut(&id) else {
                continue;
            };
            reaped += 1;

            if let Some(pty) = inst.pty.clone() {
                let mut tail = Vec::new();
                drain_pty(&pty, |bytes| {
                    inst.termbuf.append(bytes);
                    tail.extend_from_slice(bytes);
                });
                if let (Some(peer), false) = (inst.live_peer(), tail.is_empty()) {
                    tails.push((peer, tail));
                }
            }
            inst.mark_dead(status);
            info!(
                instance = inst.short_id(),
                pid,
                status,
                kind = inst.kind.as_str(),
                "instance exited"
            );

            match inst.live_peer() {
                Some(peer) => wake.push(peer),
                None => finished.extend(instances.remove(&id)),
            }
        }
    }

    for (peer, bytes) in tails {
        console::forward_output(&peer, &bytes);
    }
    for peer in wake {
        console::wake(&peer);
    }
    for instance in finished {
        teardown(backend, instance);
    }
    reaped
}

/// Release everything a removed instance still holds. Failures are logged;
/// the instance is gone from the registry either way.
pub fn teardown(backend: &dyn ProvisioningBackend, mut instance: Instance) {
    match backend.teardown(&instance.id, instance.kind) {
        Ok(0) => {}
        Ok(code) => warn!(
            instance = instance.short_id(),
            code, "cleanup script exited non-zero"
        ),
        Err(err) => warn!(
            instance = instance.short_id(),
            error = %err,
            "failed to run cleanup script"
        ),
    }
    if let Err(err) = instance.release() {
        warn!(
            instance = instance.short_id(),
            error = %err,
            "failed to remove pid lock file"
        );
    }
    debug!(instance = instance.short_id(), "instance removed");
}
