//! Shared daemon state and instance spawning.

use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cellblock_common::protocol::InstanceKind;

use crate::backend::ProvisioningBackend;
use crate::config::Config;
use crate::instance::{short_id, Instance, PidLock};
use crate::pty;
use crate::registry::Registry;

/// Shared state handed to every connection thread and the poll thread.
pub struct Daemon {
    pub config: Config,
    pub registry: Registry,
    pub backend: Arc<dyn ProvisioningBackend>,
    /// Set from the SIGCHLD handler, consumed by the poll loop.
    pub sigchld: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(config: Config, backend: Arc<dyn ProvisioningBackend>) -> Self {
        let registry = Registry::new(config.tty_buffer_size);
        Self {
            config,
            registry,
            backend,
            sigchld: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start `command` on a fresh pty and register it under `id`.
    pub fn spawn_instance(
        &self,
        id: String,
        image: String,
        kind: InstanceKind,
        command: Command,
    ) -> Result<String> {
        let child = pty::spawn_on_pty(command)
            .with_context(|| format!("failed to start {} instance on a pty", kind.as_str()))?;

        let mut instance = Instance::new(
            id.clone(),
            image,
            kind,
            child.pid,
            child.master,
            child.tty_name,
            self.registry.tty_buffer_size(),
        );
        match PidLock::acquire(&self.config.data_dir, &id, child.pid) {
            Ok(lock) => instance = instance.with_pid_lock(lock),
            Err(err) => warn!(
                instance = short_id(&id),
                pid = child.pid,
                error = %err,
                "failed to write pid lock file"
            ),
        }

        info!(
            instance = short_id(&id),
            pid = instance.pid,
            tty = %instance.tty_name,
            kind = kind.as_str(),
            image = %instance.image,
            "instance started"
        );
        self.registry.register(instance);
        Ok(id)
    }
}
