//! Load-time validation of loosely-typed persisted data.
//!
//! Persisted snapshots are decoded into plain JSON values first and then
//! pass through here once. Each entry either becomes a typed entity or is
//! reported as a [`Rejection`]; nothing downstream re-checks shapes.

use crate::entity::{
    AppData, Assistant, Case, CaseDocument, Client, FlatRecord, Invoice, InvoiceItem, Session,
    Stage,
};
use crate::row::Row;
use crate::table::Table;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An entry dropped by validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// Table the entry belongs to.
    pub table: Table,
    /// Position of the entry in its list.
    pub index: usize,
    /// Primary key, when one could be read.
    pub key: Option<String>,
    /// Why it was dropped.
    pub reason: String,
}

/// A strongly-typed value plus everything that had to be dropped to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    /// The typed value.
    pub value: T,
    /// Entries that were rejected.
    pub rejections: Vec<Rejection>,
}

impl<T> Validated<T> {
    /// Returns true if nothing was rejected.
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty()
    }
}

/// A snapshot as stored, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSnapshot {
    /// Raw clients.
    pub clients: Vec<Value>,
    /// Raw invoices.
    pub invoices: Vec<Value>,
    /// Raw admin tasks.
    pub admin_tasks: Vec<Value>,
    /// Raw appointments.
    pub appointments: Vec<Value>,
    /// Raw accounting entries.
    pub accounting_entries: Vec<Value>,
    /// Raw assistants.
    pub assistants: Vec<Value>,
    /// Raw profiles.
    pub profiles: Vec<Value>,
    /// Raw site financial entries.
    pub site_finances: Vec<Value>,
}

/// Normalizes the loosely-typed columns of a row in place.
///
/// Numeric keys and foreign keys become text, numeric timestamps (epoch
/// milliseconds) become RFC 3339 and null children lists disappear.
pub(crate) fn coerce_row(table: Table, row: &mut Row) {
    row.normalize_key(table.key_column());
    if let Some((_, fk)) = table.parent() {
        row.normalize_key(fk);
    }
    for field in ["updated_at", "added_at"] {
        match row.get(field) {
            Some(Value::Null) => {
                row.remove(field);
            }
            Some(Value::Number(n)) => {
                let converted = n
                    .as_i64()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|dt| dt.to_rfc3339());
                match converted {
                    Some(text) => row.set(field, text),
                    None => {
                        row.remove(field);
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(children) = table.children_field() {
        if matches!(row.get(children), Some(Value::Null)) {
            row.remove(children);
        }
    }
}

struct Validator {
    rejections: Vec<Rejection>,
}

impl Validator {
    fn reject(&mut self, table: Table, index: usize, key: Option<String>, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%table, index, ?key, %reason, "rejected entry");
        self.rejections.push(Rejection {
            table,
            index,
            key,
            reason,
        });
    }

    /// Checks the object shape and the key, and coerces the row.
    fn row(&mut self, table: Table, index: usize, value: Value) -> Option<Row> {
        let Some(mut row) = Row::from_value(value) else {
            self.reject(table, index, None, "entry is not an object");
            return None;
        };
        coerce_row(table, &mut row);
        if (table.key_fn())(&row).is_none() {
            self.reject(table, index, None, format!("missing {}", table.key_column()));
            return None;
        }
        Some(row)
    }

    fn children(&mut self, table: Table, index: usize, row: &mut Row) -> Vec<Value> {
        let Some(field) = table.children_field() else {
            return Vec::new();
        };
        match row.remove(field) {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                let key = (table.key_fn())(row);
                self.reject(table, index, key, format!("{field} is not a list"));
                Vec::new()
            }
        }
    }

    fn typed<T: DeserializeOwned>(&mut self, table: Table, index: usize, row: Row) -> Option<T> {
        let key = (table.key_fn())(&row);
        match serde_json::from_value(row.into_value()) {
            Ok(value) => Some(value),
            Err(e) => {
                self.reject(table, index, key, e.to_string());
                None
            }
        }
    }

    fn leaf<T: DeserializeOwned>(&mut self, table: Table, index: usize, value: Value) -> Option<T> {
        let row = self.row(table, index, value)?;
        self.typed(table, index, row)
    }

    fn list<T: DeserializeOwned>(&mut self, table: Table, values: Vec<Value>) -> Vec<T> {
        values
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| self.leaf(table, i, v))
            .collect()
    }

    fn client(&mut self, index: usize, value: Value) -> Option<Client> {
        let mut row = self.row(Table::Clients, index, value)?;
        let cases = self.children(Table::Clients, index, &mut row);
        let mut client: Client = self.typed(Table::Clients, index, row)?;
        client.cases = cases
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| self.case(i, v))
            .collect();
        Some(client)
    }

    fn case(&mut self, index: usize, value: Value) -> Option<Case> {
        let mut row = self.row(Table::Cases, index, value)?;
        let stages = self.children(Table::Cases, index, &mut row);
        let mut case: Case = self.typed(Table::Cases, index, row)?;
        case.stages = stages
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| self.stage(i, v))
            .collect();
        Some(case)
    }

    fn stage(&mut self, index: usize, value: Value) -> Option<Stage> {
        let mut row = self.row(Table::Stages, index, value)?;
        let sessions = self.children(Table::Stages, index, &mut row);
        let mut stage: Stage = self.typed(Table::Stages, index, row)?;
        stage.sessions = self.list::<Session>(Table::Sessions, sessions);
        Some(stage)
    }

    fn invoice(&mut self, index: usize, value: Value) -> Option<Invoice> {
        let mut row = self.row(Table::Invoices, index, value)?;
        let items = self.children(Table::Invoices, index, &mut row);
        let mut invoice: Invoice = self.typed(Table::Invoices, index, row)?;
        invoice.items = self.list::<InvoiceItem>(Table::InvoiceItems, items);
        Some(invoice)
    }
}

/// Validates a raw snapshot into a typed [`AppData`].
pub fn validate_snapshot(raw: RawSnapshot) -> Validated<AppData> {
    let mut v = Validator {
        rejections: Vec::new(),
    };

    let clients = raw
        .clients
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| v.client(i, value))
        .collect();
    let invoices = raw
        .invoices
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| v.invoice(i, value))
        .collect();

    let value = AppData {
        clients,
        invoices,
        admin_tasks: v.list::<FlatRecord>(Table::AdminTasks, raw.admin_tasks),
        appointments: v.list::<FlatRecord>(Table::Appointments, raw.appointments),
        accounting_entries: v.list::<FlatRecord>(Table::AccountingEntries, raw.accounting_entries),
        assistants: v.list::<Assistant>(Table::Assistants, raw.assistants),
        profiles: v.list::<FlatRecord>(Table::Profiles, raw.profiles),
        site_finances: v.list::<FlatRecord>(Table::SiteFinances, raw.site_finances),
    };

    Validated {
        value,
        rejections: v.rejections,
    }
}

/// Validates one persisted document metadata record.
///
/// # Errors
///
/// Returns the rejection when the record cannot be typed.
pub fn validate_document(value: Value) -> Result<CaseDocument, Rejection> {
    let mut v = Validator {
        rejections: Vec::new(),
    };
    v.leaf::<CaseDocument>(Table::Documents, 0, value)
        .ok_or_else(|| {
            v.rejections.pop().unwrap_or(Rejection {
                table: Table::Documents,
                index: 0,
                key: None,
                reason: "invalid document".into(),
            })
        })
}

/// Converts one flat row into a typed entity.
///
/// Applies the same coercion and key check as the snapshot validation.
pub(crate) fn typed_row<T: DeserializeOwned>(
    table: Table,
    index: usize,
    row: Row,
) -> Result<T, Rejection> {
    let mut v = Validator {
        rejections: Vec::new(),
    };
    match v
        .row(table, index, row.into_value())
        .and_then(|row| v.typed::<T>(table, index, row))
    {
        Some(value) => Ok(value),
        None => Err(v.rejections.pop().unwrap_or(Rejection {
            table,
            index,
            key: None,
            reason: "invalid row".into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DocumentState;
    use serde_json::json;

    #[test]
    fn clean_snapshot_passes() {
        let raw: RawSnapshot = serde_json::from_value(json!({
            "clients": [{
                "id": "c1",
                "updated_at": "2024-01-01T10:00:00Z",
                "cases": [{"id": "k1", "stages": [{"id": "s1", "sessions": [{"id": "x1"}]}]}]
            }],
            "invoices": [{"id": "i1", "items": [{"id": "it1"}]}],
            "assistants": [{"name": "Huda"}]
        }))
        .unwrap();

        let validated = validate_snapshot(raw);
        assert!(validated.is_clean());
        let data = validated.value;
        assert_eq!(data.clients[0].cases[0].stages[0].sessions[0].id, "x1");
        assert_eq!(data.invoices[0].items.len(), 1);
        assert_eq!(data.assistants[0].name, "Huda");
    }

    #[test]
    fn numeric_ids_and_timestamps_are_coerced() {
        let raw: RawSnapshot = serde_json::from_value(json!({
            "clients": [{"id": 1, "updated_at": 1500}],
            "profiles": [{"id": 9, "updated_at": null}]
        }))
        .unwrap();

        let validated = validate_snapshot(raw);
        assert!(validated.is_clean());
        let client = &validated.value.clients[0];
        assert_eq!(client.id, "1");
        assert_eq!(client.updated_at.unwrap().timestamp_millis(), 1500);
        assert_eq!(validated.value.profiles[0].updated_at, None);
    }

    #[test]
    fn malformed_entries_are_rejected_not_fatal() {
        let raw: RawSnapshot = serde_json::from_value(json!({
            "clients": [
                "not an object",
                {"name": "no id"},
                {"id": "c3", "updated_at": "yesterday"},
                {"id": "c4", "cases": [{"id": "k1"}, {"stages": []}]},
                {"id": "c5", "cases": 12}
            ]
        }))
        .unwrap();

        let validated = validate_snapshot(raw);
        let ids: Vec<_> = validated.value.clients.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c4", "c5"]);
        assert_eq!(validated.value.clients[0].cases.len(), 1);
        assert!(validated.value.clients[1].cases.is_empty());

        let reasons: Vec<_> = validated
            .rejections
            .iter()
            .map(|r| (r.table, r.index))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (Table::Clients, 0),
                (Table::Clients, 1),
                (Table::Clients, 2),
                (Table::Cases, 1),
                (Table::Clients, 4),
            ]
        );
        assert_eq!(validated.rejections[2].key.as_deref(), Some("c3"));
    }

    #[test]
    fn document_validation() {
        let doc = validate_document(json!({
            "id": "d1",
            "case_id": 10,
            "user_id": "u1",
            "name": "a.pdf",
            "mime_type": "application/pdf",
            "size": 3,
            "added_at": 0,
            "storage_path": "u1/10/d1-a.pdf",
            "local_state": "synced"
        }))
        .unwrap();
        assert_eq!(doc.case_id, "10");
        assert_eq!(doc.local_state, DocumentState::Synced);

        let err = validate_document(json!({"id": "d2", "local_state": "bogus"})).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("d2"));
    }
}
