use tracing::{info, instrument};

use tutoria_sandbox::SandboxControl;
use tutoria_store::SessionStore;

use crate::error::Result;

/// Bring stored records in line with this process before accepting connections.
///
/// No socket survives a restart, so every `connectedClients` list is emptied.
/// `isVMRunning` stays set only where the sandbox layer still holds a worker,
/// and a reply left pending by a previous process is dropped. Returns the
/// number of records rewritten.
#[instrument(skip_all)]
pub async fn reconcile_sessions(store: &dyn SessionStore, sandbox: &dyn SandboxControl) -> Result<usize> {
    let mut changed = 0;
    for record in store.list().await? {
        let running = record.is_vm_running && sandbox.is_running(&record.code);
        let stale = !record.connected_clients.is_empty()
            || record.is_vm_running != running
            || record.is_replying;
        if !stale {
            continue;
        }
        let next = record
            .retain_clients(|_| false)
            .with_vm_running(running)
            .with_reply_cleared();
        store.set(&next.code, &next).await?;
        changed += 1;
    }
    info!(changed, "sessions reconciled");
    Ok(changed)
}
