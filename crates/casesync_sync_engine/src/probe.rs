//! Remote schema probe.

use crate::error::{SyncError, SyncResult};
use crate::gateway::RemoteGateway;
use casesync_model::Table;

/// Checks that every entity table exists remotely.
///
/// Issues one read-only existence check per table, in push order, and stops
/// at the first problem: a missing table yields [`SyncError::Schema`], any
/// other failure is passed through as a connectivity error.
pub fn probe_schema(gateway: &dyn RemoteGateway) -> SyncResult<()> {
    for table in Table::PUSH_ORDER {
        match gateway.table_exists(table) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(%table, "remote table missing");
                return Err(SyncError::Schema {
                    table: table.remote_name().to_string(),
                });
            }
            Err(e @ SyncError::Transport { .. }) => return Err(e),
            Err(e) => return Err(SyncError::transport_retryable(e.to_string())),
        }
    }
    tracing::debug!("schema probe passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RemoteOp};

    #[test]
    fn all_tables_present() {
        assert!(probe_schema(&MemoryRemote::new()).is_ok());
    }

    #[test]
    fn missing_table_is_schema_error() {
        let remote = MemoryRemote::new();
        remote.drop_table(Table::InvoiceItems);
        match probe_schema(&remote) {
            Err(SyncError::Schema { table }) => assert_eq!(table, "invoice_items"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn probe_failure_is_connectivity() {
        let remote = MemoryRemote::new();
        remote.fail(RemoteOp::Probe, None, true);
        let err = probe_schema(&remote).unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert!(err.is_retryable());
    }
}
