//! Entity Mapper: nested tree ⇄ flat per-table rows.

use crate::entity::{
    AppData, Assistant, Case, CaseDocument, Client, DocumentState, FlatRecord, Invoice,
    InvoiceItem, Session, Stage,
};
use crate::error::ModelResult;
use crate::row::Row;
use crate::table::Table;
use crate::validate::{typed_row, Rejection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Independent per-table record sets linked by foreign keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatTables {
    tables: BTreeMap<Table, Vec<Row>>,
}

impl FlatTables {
    /// Creates an empty set of tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of a table (empty if absent).
    pub fn rows(&self, table: Table) -> &[Row] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable rows of a table, created on demand.
    pub fn rows_mut(&mut self, table: Table) -> &mut Vec<Row> {
        self.tables.entry(table).or_default()
    }

    /// Replaces the rows of a table.
    pub fn insert(&mut self, table: Table, rows: Vec<Row>) {
        self.tables.insert(table, rows);
    }

    /// Builder-style [`FlatTables::insert`].
    #[must_use]
    pub fn with(mut self, table: Table, rows: Vec<Row>) -> Self {
        self.insert(table, rows);
        self
    }

    /// Takes the rows of a table out.
    pub fn take(&mut self, table: Table) -> Vec<Row> {
        self.tables.remove(&table).unwrap_or_default()
    }

    /// Iterates non-empty tables in table order.
    pub fn iter(&self) -> impl Iterator<Item = (Table, &[Row])> {
        self.tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(t, rows)| (*t, rows.as_slice()))
    }

    /// Total number of rows across tables.
    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// A child row that could not be attached to the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct RowRef {
    /// Table of the row.
    pub table: Table,
    /// Primary key of the row.
    pub key: String,
    /// Parent key it points at, if any.
    pub parent_key: Option<String>,
}

/// Result of rebuilding the tree from flat tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    /// The rebuilt tree.
    pub data: AppData,
    /// Children whose parent was absent; dropped from the tree.
    pub orphans: Vec<RowRef>,
    /// Rows that could not be typed.
    pub rejections: Vec<Rejection>,
}

fn to_row<T: Serialize>(value: &T) -> ModelResult<Row> {
    let value = serde_json::to_value(value)?;
    Ok(Row::from_value(value).unwrap_or_default())
}

fn child_row<T: Serialize>(value: &T, fk: &str, parent_id: &str) -> ModelResult<Row> {
    Ok(to_row(value)?.with(fk, parent_id))
}

fn fk_column(table: Table) -> &'static str {
    table.parent().map(|(_, fk)| fk).unwrap_or_default()
}

/// Flattens the tree into per-table rows.
///
/// Each child gains its parent's id under the table's foreign key column
/// and loses its nested children field.
///
/// # Errors
///
/// Returns an error if an entity cannot be serialized.
pub fn flatten(data: &AppData) -> ModelResult<FlatTables> {
    let mut out = FlatTables::new();

    for client in &data.clients {
        let node = Client {
            cases: Vec::new(),
            ..client.clone()
        };
        out.rows_mut(Table::Clients).push(to_row(&node)?);

        for case in &client.cases {
            let node = Case {
                stages: Vec::new(),
                ..case.clone()
            };
            out.rows_mut(Table::Cases)
                .push(child_row(&node, fk_column(Table::Cases), &client.id)?);

            for stage in &case.stages {
                let node = Stage {
                    sessions: Vec::new(),
                    ..stage.clone()
                };
                out.rows_mut(Table::Stages)
                    .push(child_row(&node, fk_column(Table::Stages), &case.id)?);

                for session in &stage.sessions {
                    out.rows_mut(Table::Sessions).push(child_row(
                        session,
                        fk_column(Table::Sessions),
                        &stage.id,
                    )?);
                }
            }
        }
    }

    for invoice in &data.invoices {
        let node = Invoice {
            items: Vec::new(),
            ..invoice.clone()
        };
        out.rows_mut(Table::Invoices).push(to_row(&node)?);
        for item in &invoice.items {
            out.rows_mut(Table::InvoiceItems).push(child_row(
                item,
                fk_column(Table::InvoiceItems),
                &invoice.id,
            )?);
        }
    }

    let flat: [(Table, &[FlatRecord]); 5] = [
        (Table::AdminTasks, data.admin_tasks.as_slice()),
        (Table::Appointments, data.appointments.as_slice()),
        (Table::AccountingEntries, data.accounting_entries.as_slice()),
        (Table::Profiles, data.profiles.as_slice()),
        (Table::SiteFinances, data.site_finances.as_slice()),
    ];
    for (table, records) in flat {
        let rows = records.iter().map(to_row).collect::<ModelResult<Vec<_>>>()?;
        out.insert(table, rows);
    }
    let assistants = data
        .assistants
        .iter()
        .map(to_row)
        .collect::<ModelResult<Vec<_>>>()?;
    out.insert(Table::Assistants, assistants);

    Ok(out)
}

/// Converts document metadata into the row pushed remotely.
///
/// The device-local `local_state` column is stripped.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn document_row(doc: &CaseDocument) -> ModelResult<Row> {
    let mut row = to_row(doc)?;
    row.remove("local_state");
    Ok(row)
}

/// Converts every document into its remote row.
///
/// # Errors
///
/// Returns an error if a document cannot be serialized.
pub fn flatten_documents(docs: &[CaseDocument]) -> ModelResult<Vec<Row>> {
    docs.iter().map(document_row).collect()
}

struct Rebuilder {
    orphans: Vec<RowRef>,
    rejections: Vec<Rejection>,
}

impl Rebuilder {
    /// Types every row of a table and groups it by parent key.
    ///
    /// Group order follows row order.
    fn group<T, K>(&mut self, tables: &FlatTables, table: Table, key_of: K) -> Groups<T>
    where
        T: DeserializeOwned,
        K: Fn(&T) -> String,
    {
        let fk = fk_column(table);
        let mut groups = Groups::default();
        for (index, row) in tables.rows(table).iter().enumerate() {
            let mut row = row.clone();
            row.normalize_key(fk);
            let parent = match row.remove(fk) {
                Some(Value::String(s)) if !s.is_empty() => Some(s),
                _ => None,
            };
            let entity: T = match typed_row(table, index, row) {
                Ok(entity) => entity,
                Err(rejection) => {
                    self.rejections.push(rejection);
                    continue;
                }
            };
            match parent {
                Some(parent) => groups.push(parent, entity),
                None => self.orphans.push(RowRef {
                    table,
                    key: key_of(&entity),
                    parent_key: None,
                }),
            }
        }
        groups
    }

    fn roots<T: DeserializeOwned>(&mut self, tables: &FlatTables, table: Table) -> Vec<T> {
        let mut out = Vec::new();
        for (index, row) in tables.rows(table).iter().enumerate() {
            match typed_row(table, index, row.clone()) {
                Ok(entity) => out.push(entity),
                Err(rejection) => self.rejections.push(rejection),
            }
        }
        out
    }

    fn leftovers<T, K>(&mut self, table: Table, groups: Groups<T>, key_of: K)
    where
        K: Fn(&T) -> String,
    {
        for (parent, children) in groups.by_parent {
            for child in children {
                self.orphans.push(RowRef {
                    table,
                    key: key_of(&child),
                    parent_key: Some(parent.clone()),
                });
            }
        }
    }
}

struct Groups<T> {
    by_parent: HashMap<String, Vec<T>>,
}

impl<T> Default for Groups<T> {
    fn default() -> Self {
        Self {
            by_parent: HashMap::new(),
        }
    }
}

impl<T> Groups<T> {
    fn push(&mut self, parent: String, child: T) {
        self.by_parent.entry(parent).or_default().push(child);
    }

    fn take(&mut self, parent: &str) -> Vec<T> {
        self.by_parent.remove(parent).unwrap_or_default()
    }
}

/// Rebuilds the tree from flat tables, innermost first.
///
/// Never fails: rows that cannot be typed are reported as rejections and
/// children whose parent is absent are reported as orphans. Both are left
/// out of the tree.
pub fn reconstruct(tables: &FlatTables) -> Reconstruction {
    let mut rb = Rebuilder {
        orphans: Vec::new(),
        rejections: Vec::new(),
    };

    let mut sessions = rb.group::<Session, _>(tables, Table::Sessions, |s| s.id.clone());
    let mut stages = rb.group::<Stage, _>(tables, Table::Stages, |s| s.id.clone());
    for children in stages.by_parent.values_mut() {
        for stage in children.iter_mut() {
            stage.sessions = sessions.take(&stage.id);
        }
    }
    let mut cases = rb.group::<Case, _>(tables, Table::Cases, |c| c.id.clone());
    for children in cases.by_parent.values_mut() {
        for case in children.iter_mut() {
            case.stages = stages.take(&case.id);
        }
    }
    let mut clients: Vec<Client> = rb.roots(tables, Table::Clients);
    for client in clients.iter_mut() {
        client.cases = cases.take(&client.id);
    }

    let mut items = rb.group::<InvoiceItem, _>(tables, Table::InvoiceItems, |i| i.id.clone());
    let mut invoices: Vec<Invoice> = rb.roots(tables, Table::Invoices);
    for invoice in invoices.iter_mut() {
        invoice.items = items.take(&invoice.id);
    }

    rb.leftovers(Table::Sessions, sessions, |s| s.id.clone());
    rb.leftovers(Table::Stages, stages, |s| s.id.clone());
    rb.leftovers(Table::Cases, cases, |c| c.id.clone());
    rb.leftovers(Table::InvoiceItems, items, |i| i.id.clone());

    let data = AppData {
        clients,
        invoices,
        admin_tasks: rb.roots::<FlatRecord>(tables, Table::AdminTasks),
        appointments: rb.roots::<FlatRecord>(tables, Table::Appointments),
        accounting_entries: rb.roots::<FlatRecord>(tables, Table::AccountingEntries),
        assistants: rb.roots::<Assistant>(tables, Table::Assistants),
        profiles: rb.roots::<FlatRecord>(tables, Table::Profiles),
        site_finances: rb.roots::<FlatRecord>(tables, Table::SiteFinances),
    };

    rb.orphans.sort();
    if !rb.orphans.is_empty() {
        tracing::debug!(count = rb.orphans.len(), "dropped orphan rows from tree");
    }

    Reconstruction {
        data,
        orphans: rb.orphans,
        rejections: rb.rejections,
    }
}

/// Rebuilds document metadata from merged rows.
///
/// Known documents keep their device-local state; documents first seen in
/// the rows start as `pending_download`.
pub fn reconstruct_documents(
    rows: &[Row],
    existing: &[CaseDocument],
) -> (Vec<CaseDocument>, Vec<Rejection>) {
    let states: HashMap<&str, DocumentState> = existing
        .iter()
        .map(|d| (d.id.as_str(), d.local_state))
        .collect();

    let mut docs = Vec::new();
    let mut rejections = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let mut row = row.clone();
        let state = row
            .text("id")
            .and_then(|id| states.get(id.as_str()).copied())
            .unwrap_or(DocumentState::PendingDownload);
        let state_value = serde_json::to_value(state).unwrap_or(Value::Null);
        row.set("local_state", state_value);
        match typed_row::<CaseDocument>(Table::Documents, index, row) {
            Ok(doc) => docs.push(doc),
            Err(rejection) => rejections.push(rejection),
        }
    }
    (docs, rejections)
}
