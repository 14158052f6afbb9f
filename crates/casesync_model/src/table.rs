//! Remote table metadata.

use crate::error::ModelError;
use crate::row::{key_by_id, key_by_name, KeyFn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An entity table, both locally (flat record set) and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// User profiles.
    Profiles,
    /// Assistants, keyed by name.
    Assistants,
    /// Clients (tree root).
    Clients,
    /// Cases, children of clients.
    Cases,
    /// Stages, children of cases.
    Stages,
    /// Sessions, children of stages.
    Sessions,
    /// Invoices (tree root).
    Invoices,
    /// Invoice items, children of invoices.
    InvoiceItems,
    /// Case document metadata, children of cases.
    #[serde(rename = "case_documents")]
    Documents,
    /// Administrative tasks.
    AdminTasks,
    /// Appointments.
    Appointments,
    /// Accounting entries.
    AccountingEntries,
    /// Site financial entries.
    SiteFinances,
}

impl Table {
    /// Every table, in push (parents before children) order.
    pub const PUSH_ORDER: [Table; 13] = [
        Table::Profiles,
        Table::Assistants,
        Table::Clients,
        Table::Cases,
        Table::Stages,
        Table::Sessions,
        Table::Invoices,
        Table::InvoiceItems,
        Table::Documents,
        Table::AdminTasks,
        Table::Appointments,
        Table::AccountingEntries,
        Table::SiteFinances,
    ];

    /// Every table, in deletion (children before parents) order.
    pub const DELETE_ORDER: [Table; 13] = [
        Table::Documents,
        Table::InvoiceItems,
        Table::Sessions,
        Table::Stages,
        Table::Cases,
        Table::Invoices,
        Table::AdminTasks,
        Table::Appointments,
        Table::AccountingEntries,
        Table::Assistants,
        Table::Clients,
        Table::SiteFinances,
        Table::Profiles,
    ];

    /// Name of the table on the remote store.
    pub fn remote_name(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Assistants => "assistants",
            Table::Clients => "clients",
            Table::Cases => "cases",
            Table::Stages => "stages",
            Table::Sessions => "sessions",
            Table::Invoices => "invoices",
            Table::InvoiceItems => "invoice_items",
            Table::Documents => "case_documents",
            Table::AdminTasks => "admin_tasks",
            Table::Appointments => "appointments",
            Table::AccountingEntries => "accounting_entries",
            Table::SiteFinances => "site_finances",
        }
    }

    /// Primary key column.
    pub fn key_column(&self) -> &'static str {
        match self {
            Table::Assistants => "name",
            _ => "id",
        }
    }

    /// Key extraction function for rows of this table.
    pub fn key_fn(&self) -> KeyFn {
        match self {
            Table::Assistants => key_by_name,
            _ => key_by_id,
        }
    }

    /// Parent table and the foreign key column pointing at it.
    pub fn parent(&self) -> Option<(Table, &'static str)> {
        match self {
            Table::Cases => Some((Table::Clients, "client_id")),
            Table::Stages => Some((Table::Cases, "case_id")),
            Table::Sessions => Some((Table::Stages, "stage_id")),
            Table::InvoiceItems => Some((Table::Invoices, "invoice_id")),
            Table::Documents => Some((Table::Cases, "case_id")),
            _ => None,
        }
    }

    /// Name of the nested children field a tree node carries, if any.
    pub fn children_field(&self) -> Option<&'static str> {
        match self {
            Table::Clients => Some("cases"),
            Table::Cases => Some("stages"),
            Table::Stages => Some("sessions"),
            Table::Invoices => Some("items"),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.remote_name())
    }
}

impl FromStr for Table {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::PUSH_ORDER
            .iter()
            .copied()
            .find(|t| t.remote_name() == s)
            .ok_or_else(|| ModelError::UnknownTable(s.to_string()))
    }
}
