//! The merge engine: applies a foreign change entry to a user table under
//! one of four CRDT policies, maintaining the causal-length invariants of
//! spec.md §4.6.

use std::cmp::Ordering;

use rusqlite::Connection;

use crate::changelog::{Algo, ChangeEntry, ChangeLog};
use crate::codec::{self, Value};
use crate::error::{CloudsyncError, Result};
use crate::idgen::SiteId;
use crate::schema::TableSchema;
use crate::settings::SettingsStore;

/// Outcome of one merge attempt. Policy-level rejection is represented
/// here, not as an `Err` — per spec.md §7 a policy skip is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Applied,
    Skipped { reason: String },
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Three-step observer hook around a merge. All methods default to no-ops;
/// `will_apply` may veto the write by returning `false`.
pub trait MergeObserver {
    fn will_apply(&mut self, _entry: &ChangeEntry) -> bool {
        true
    }
    fn did_apply(&mut self, _entry: &ChangeEntry) {}
    fn cleanup(&mut self) {}
}

/// Default observer that never vetoes and does nothing else.
pub struct NoopObserver;
impl MergeObserver for NoopObserver {}

/// `(col_version, site_id)` ordered pair used for last-writer-wins
/// comparisons, per spec.md §4.6.
fn version_wins(foreign: (u64, SiteId), local: (u64, SiteId)) -> Ordering {
    match foreign.0.cmp(&local.0) {
        Ordering::Equal => foreign.1.compare(&local.1),
        ord => ord,
    }
}

pub struct MergeEngine<'c> {
    conn: &'c Connection,
    changelog: ChangeLog<'c>,
    settings: SettingsStore<'c>,
}

impl<'c> MergeEngine<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            changelog: ChangeLog::new(conn),
            settings: SettingsStore::new(conn),
        }
    }

    /// Apply one foreign change entry under `algo`. Runs in its own
    /// transaction; rolled back whole on any error, per spec.md §4.6's
    /// transaction discipline.
    pub fn apply_foreign_change(
        &self,
        entry: &ChangeEntry,
        algo: Algo,
        schema: &TableSchema,
        observer: &mut dyn MergeObserver,
    ) -> Result<MergeOutcome> {
        let tx = self.conn.unchecked_transaction()?;

        let local = self.changelog.current(&entry.table, &entry.pk, entry.column.as_deref())?;
        let row_local = if entry.is_row_level() {
            local.clone()
        } else {
            self.changelog.latest_for_row(&entry.table, &entry.pk)?
        };
        let outcome = self.decide(entry, algo, local.as_ref(), row_local.as_ref())?;

        if let MergeOutcome::Applied = outcome {
            if !observer.will_apply(entry) {
                tx.rollback()?;
                observer.cleanup();
                return Ok(MergeOutcome::Skipped {
                    reason: "vetoed by observer".into(),
                });
            }

            self.write_user_row(entry, schema)?;

            let next_db_version = self.settings.current_db_version()? + 1;
            self.settings.set_int(crate::settings::KEY_DBVERSION, next_db_version as i64)?;

            let stamped = ChangeEntry {
                db_version: next_db_version,
                seq: 0, // one change per apply-transaction: always seq 0 locally
                ..entry.clone()
            };
            self.changelog.append(&stamped)?;

            observer.did_apply(&stamped);
            tx.commit()?;
        } else {
            tx.commit()?;
        }

        observer.cleanup();
        Ok(outcome)
    }

    /// Pure decision function: does `entry` win against `local`? `local` is
    /// the per-(table,pk,column) record used for the version tie-break;
    /// `row_local` is the most-recently-touched record for the whole row
    /// (any column) used for the CL gate below, since deletes and
    /// inserts/updates never land in the same column slot. Separated from
    /// the write path so it is trivially unit-testable.
    fn decide(
        &self,
        entry: &ChangeEntry,
        algo: Algo,
        local: Option<&ChangeEntry>,
        row_local: Option<&ChangeEntry>,
    ) -> Result<MergeOutcome> {
        let Some(local) = local else {
            // No local record for this (table, pk, column): apply
            // unconditionally, subject to the CL gate.
            return self.cl_gate(entry, algo, row_local);
        };

        if entry.col_version == local.col_version && entry.site_id == local.site_id {
            return Ok(MergeOutcome::Skipped {
                reason: "already applied".into(),
            });
        }

        let wins = version_wins(
            (entry.col_version, entry.site_id),
            (local.col_version, local.site_id),
        );
        if wins != Ordering::Greater {
            return Ok(MergeOutcome::Skipped {
                reason: "local change is newer or wins the site-id tie-break".into(),
            });
        }

        self.cl_gate(entry, algo, row_local)
    }

    /// Table from spec.md §4.6: gates whether the row is considered
    /// "present" under each algorithm. `local` here is always the row-level
    /// record (see `decide`), not the column-specific one.
    fn cl_gate(&self, entry: &ChangeEntry, algo: Algo, local: Option<&ChangeEntry>) -> Result<MergeOutcome> {
        let is_tombstone_arrival = entry.is_row_level() && matches!(entry.value, Value::Tombstone);
        let local_cl = local.map(|l| l.cl).unwrap_or(0);
        let local_tombstoned = local_cl != 0 && local_cl % 2 == 0;

        match algo {
            Algo::Gos => {
                if is_tombstone_arrival {
                    Ok(MergeOutcome::Skipped {
                        reason: "GOS does not track deletes".into(),
                    })
                } else {
                    Ok(MergeOutcome::Applied)
                }
            }
            Algo::Cls => {
                // The strict-CL requirement only governs transitions across
                // a row's liveness boundary (a delete, or a re-insert over a
                // tombstoned row); a plain column update on an already-live
                // row is governed entirely by the version tie-break above.
                if is_tombstone_arrival || local_tombstoned {
                    if entry.cl > local_cl {
                        Ok(MergeOutcome::Applied)
                    } else {
                        Ok(MergeOutcome::Skipped {
                            reason: "causal length did not strictly increase".into(),
                        })
                    }
                } else {
                    Ok(MergeOutcome::Applied)
                }
            }
            Algo::Dws => {
                if is_tombstone_arrival {
                    // Tombstones are sticky under delete-wins.
                    Ok(MergeOutcome::Applied)
                } else if local_tombstoned {
                    Ok(MergeOutcome::Skipped {
                        reason: "row is tombstoned under delete-wins".into(),
                    })
                } else {
                    Ok(MergeOutcome::Applied)
                }
            }
            Algo::Aws => {
                if is_tombstone_arrival {
                    match local {
                        Some(local)
                            if version_wins(
                                (entry.col_version, entry.site_id),
                                (local.col_version, local.site_id),
                            ) == Ordering::Greater =>
                        {
                            Ok(MergeOutcome::Applied)
                        }
                        Some(_) => Ok(MergeOutcome::Skipped {
                            reason: "add-wins: a concurrent insert dominates this tombstone".into(),
                        }),
                        None => Ok(MergeOutcome::Applied),
                    }
                } else {
                    // Inserts/updates always dominate under add-wins.
                    Ok(MergeOutcome::Applied)
                }
            }
        }
    }

    /// Mutate the actual user table to reflect an applied change.
    fn write_user_row(&self, entry: &ChangeEntry, schema: &TableSchema) -> Result<()> {
        let pk_values = codec::decode_pk(&entry.pk)?;
        if pk_values.len() != schema.pk_columns.len() {
            return Err(CloudsyncError::Integrity(format!(
                "primary key arity mismatch for table '{}'",
                entry.table
            )));
        }

        match &entry.column {
            None => {
                // Row-level entry: currently only ever a tombstone.
                let where_clause = schema
                    .pk_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("\"{c}\" = ?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let sql = format!("DELETE FROM \"{}\" WHERE {}", entry.table, where_clause);
                let params: Vec<Box<dyn rusqlite::ToSql>> = pk_values.iter().map(value_to_boxed_sql).collect();
                let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
                self.conn.execute(&sql, refs.as_slice())?;
            }
            Some(column) => {
                let all_cols: Vec<String> = schema
                    .pk_columns
                    .iter()
                    .cloned()
                    .chain(std::iter::once(column.clone()))
                    .collect();
                let placeholders: Vec<String> = (1..=all_cols.len()).map(|i| format!("?{i}")).collect();
                let conflict_cols = schema
                    .pk_columns
                    .iter()
                    .map(|c| format!("\"{c}\""))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO \"{table}\" ({cols}) VALUES ({vals})
                     ON CONFLICT({conflict}) DO UPDATE SET \"{col}\" = excluded.\"{col}\"",
                    table = entry.table,
                    cols = all_cols
                        .iter()
                        .map(|c| format!("\"{c}\""))
                        .collect::<Vec<_>>()
                        .join(", "),
                    vals = placeholders.join(", "),
                    conflict = conflict_cols,
                    col = column,
                );
                let mut all_values = pk_values;
                all_values.push(entry.value.clone());
                let params: Vec<Box<dyn rusqlite::ToSql>> = all_values.iter().map(value_to_boxed_sql).collect();
                let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
                self.conn.execute(&sql, refs.as_slice())?;
            }
        }
        Ok(())
    }
}

fn value_to_boxed_sql(value: &Value) -> Box<dyn rusqlite::ToSql> {
    match value {
        Value::Integer(n) => Box::new(*n),
        Value::Float(f) => Box::new(*f),
        Value::Text(s) => Box::new(s.clone()),
        Value::Blob(b) => Box::new(b.clone()),
        Value::Null => Box::new(Option::<i64>::None),
        Value::Tombstone => Box::new(codec::TOMBSTONE.to_string()),
        Value::RlsRestricted => Box::new(codec::RLS_RESTRICTED.to_string()),
    }
}
