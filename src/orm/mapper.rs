//! The object mapper: per-type reconciliation state plus the persist / load /
//! delete operations gated on it.
//!
//! State per mapped type is `Reconciling`, then `Mapped` or `Failed`.
//! Operations issued while a type is `Reconciling` are queued and resumed in
//! issue order, exactly once, when reconciliation finishes. Registry state is
//! only changed from the host thread; the mutex makes that safe to rely on
//! from any caller.

use crate::config::OrmSettings;
use crate::db::connection::Connection;
use crate::db::value::Value;
use crate::error::TickError;
use crate::orm::OnceCallback;
use crate::orm::mapping::{Mapped, TableMapping};
use crate::orm::migration::Migrator;
use crate::orm::reconcile::{self, Outcome, Reconciliation};
use crate::orm::table::Table;
use parking_lot::Mutex;
use std::any::{Any, TypeId, type_name};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    Reconciling,
    Mapped,
    /// Terminal until the type is mapped again.
    Failed { reason: String },
}

/// An operation waiting on reconciliation. Receives the error that stopped
/// it, if any.
type DeferredOp = Box<dyn FnOnce(&ObjectRelationalMapper, Option<TickError>) + Send>;

struct Deferred {
    ticket: u64,
    op: DeferredOp,
}

struct TypeEntry {
    version: String,
    state: MappingState,
    table: Table,
    mapping: Arc<dyn Any + Send + Sync>,
    pending: VecDeque<Deferred>,
}

#[derive(Default)]
struct MappingRegistry {
    entries: HashMap<TypeId, TypeEntry>,
    next_ticket: u64,
}

enum Gate<F> {
    Ready(F),
    Deferred { ticket: u64, table: String },
    Failed { op: F, table: String, reason: String },
}

#[derive(Clone)]
pub struct ObjectRelationalMapper {
    conn: Connection,
    settings: OrmSettings,
    registry: Arc<Mutex<MappingRegistry>>,
}

impl ObjectRelationalMapper {
    pub fn new(conn: Connection, settings: OrmSettings) -> Self {
        Self {
            conn,
            settings,
            registry: Arc::new(Mutex::new(MappingRegistry::default())),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn state<T: Mapped>(&self) -> Option<MappingState> {
        self.registry
            .lock()
            .entries
            .get(&TypeId::of::<T>())
            .map(|e| e.state.clone())
    }

    pub fn table<T: Mapped>(&self) -> Result<Table, TickError> {
        self.registry
            .lock()
            .entries
            .get(&TypeId::of::<T>())
            .map(|e| e.table.clone())
            .ok_or(TickError::NotMapped(type_name::<T>()))
    }

    pub fn mapping<T: Mapped>(&self) -> Result<Arc<TableMapping<T>>, TickError> {
        let mapping = self
            .registry
            .lock()
            .entries
            .get(&TypeId::of::<T>())
            .map(|e| e.mapping.clone())
            .ok_or(TickError::NotMapped(type_name::<T>()))?;
        mapping
            .downcast::<TableMapping<T>>()
            .map_err(|_| TickError::NotMapped(type_name::<T>()))
    }

    pub fn map<T: Mapped>(
        &self,
        version: &str,
        migrator: Option<Arc<dyn Migrator>>,
    ) -> Result<(), TickError> {
        self.map_with::<T, _>(version, migrator, |_| {})
    }

    /// Map `T` at `version` and reconcile its table. `on_reconciled` runs on
    /// the host thread with the outcome, before any queued operation resumes.
    ///
    /// Mapping again at the version already mapped does nothing.
    pub fn map_with<T, F>(
        &self,
        version: &str,
        migrator: Option<Arc<dyn Migrator>>,
        on_reconciled: F,
    ) -> Result<(), TickError>
    where
        T: Mapped,
        F: FnOnce(Result<(), TickError>) + Send + 'static,
    {
        let mapping = TableMapping::<T>::build(version)?;
        let table = mapping.table().clone();
        let type_id = TypeId::of::<T>();

        {
            let mut reg = self.registry.lock();
            let current = reg
                .entries
                .get(&type_id)
                .map(|e| (e.state.clone(), e.version.clone()));
            match current {
                Some((MappingState::Reconciling, _)) => {
                    return Err(TickError::ReconcileInProgress(table.name));
                }
                Some((MappingState::Mapped, mapped)) if mapped == version => {
                    drop(reg);
                    debug!(table = %table.name, version, "already mapped at this version");
                    return self
                        .conn
                        .dispatcher()
                        .run_on_host(move || on_reconciled(Ok(())));
                }
                _ => {}
            }
            reg.entries.insert(
                type_id,
                TypeEntry {
                    version: version.to_string(),
                    state: MappingState::Reconciling,
                    table: table.clone(),
                    mapping: Arc::new(mapping),
                    pending: VecDeque::new(),
                },
            );
        }

        info!(
            table = %table.name,
            version,
            policy = ?self.settings.policy,
            "reconciling table"
        );
        let orm = self.clone();
        let done = OnceCallback::new(move |outcome: Outcome| orm.finish(type_id, outcome, on_reconciled));
        reconcile::start(
            self.settings.policy,
            Reconciliation {
                conn: self.conn.clone(),
                table,
                migrator,
                done,
            },
        );
        Ok(())
    }

    fn finish<F>(&self, type_id: TypeId, outcome: Outcome, on_reconciled: F)
    where
        F: FnOnce(Outcome),
    {
        let (table, pending) = {
            let mut reg = self.registry.lock();
            let Some(entry) = reg.entries.get_mut(&type_id) else {
                return;
            };
            entry.state = match &outcome {
                Ok(()) => MappingState::Mapped,
                Err(e) => MappingState::Failed {
                    reason: e.to_string(),
                },
            };
            (entry.table.name.clone(), std::mem::take(&mut entry.pending))
        };

        let failure = match &outcome {
            Ok(()) => {
                info!(table = %table, resumed = pending.len(), "table mapped");
                None
            }
            Err(e) => {
                error!(table = %table, error = %e, "reconciliation failed");
                Some(e.to_string())
            }
        };
        on_reconciled(outcome);

        for deferred in pending {
            let blocked = failure.as_ref().map(|reason| TickError::ReconciliationFailed {
                table: table.clone(),
                reason: reason.clone(),
            });
            (deferred.op)(self, blocked);
        }
    }

    /// Run `op` now if `T` is mapped, or queue it behind the in-flight
    /// reconciliation.
    fn resume<T, F>(&self, op: F) -> Result<(), TickError>
    where
        T: Mapped,
        F: FnOnce(&ObjectRelationalMapper, Option<TickError>) + Send + 'static,
    {
        let type_id = TypeId::of::<T>();
        let gate = {
            let mut guard = self.registry.lock();
            let reg = &mut *guard;
            let entry = reg
                .entries
                .get_mut(&type_id)
                .ok_or(TickError::NotMapped(type_name::<T>()))?;
            match &entry.state {
                MappingState::Mapped => Gate::Ready(op),
                MappingState::Failed { reason } => Gate::Failed {
                    op,
                    table: entry.table.name.clone(),
                    reason: reason.clone(),
                },
                MappingState::Reconciling => {
                    let ticket = reg.next_ticket;
                    reg.next_ticket += 1;
                    entry.pending.push_back(Deferred {
                        ticket,
                        op: Box::new(op),
                    });
                    Gate::Deferred {
                        ticket,
                        table: entry.table.name.clone(),
                    }
                }
            }
        };

        match gate {
            Gate::Ready(op) => {
                op(self, None);
                Ok(())
            }
            Gate::Failed { op, table, reason } => {
                let orm = self.clone();
                let blocked = TickError::ReconciliationFailed { table, reason };
                self.conn
                    .dispatcher()
                    .run_on_host(move || op(&orm, Some(blocked)))
            }
            Gate::Deferred { ticket, table } => {
                debug!(table = %table, ticket, "operation queued behind reconciliation");
                self.schedule_timeout(type_id, ticket, table);
                Ok(())
            }
        }
    }

    fn schedule_timeout(&self, type_id: TypeId, ticket: u64, table: String) {
        let Some(waited) = self.settings.wait_timeout() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(table = %table, "no runtime to enforce the wait timeout");
            return;
        };
        let orm = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(waited).await;
            let host = orm.clone();
            if let Err(e) = orm
                .conn
                .dispatcher()
                .run_on_host(move || host.expire(type_id, ticket, table, waited))
            {
                warn!(ticket, error = %e, "could not expire queued operation");
            }
        });
    }

    fn expire(&self, type_id: TypeId, ticket: u64, table: String, waited: Duration) {
        let expired = {
            let mut reg = self.registry.lock();
            reg.entries.get_mut(&type_id).and_then(|entry| {
                let pos = entry.pending.iter().position(|d| d.ticket == ticket)?;
                entry.pending.remove(pos)
            })
        };
        if let Some(deferred) = expired {
            warn!(table = %table, ticket, ?waited, "queued operation timed out");
            (deferred.op)(self, Some(TickError::ReconcileTimeout { table, waited }));
        }
    }

    /// Report `e` to `on_error` from the host thread. If the host is gone the
    /// error is reported in place.
    fn fail_on_host(&self, on_error: OnceCallback<TickError>, e: TickError) {
        let message = e.to_string();
        let deliver = on_error.clone();
        if let Err(unavailable) = self.conn.dispatcher().run_on_host(move || deliver.call(e)) {
            warn!(error = %message, dispatch = %unavailable, "host unavailable; reporting inline");
            on_error.call(unavailable);
        }
    }

    /// Store `instance`: INSERT when no row has its key, REPLACE otherwise.
    /// A generated auto-increment key is written back before `on_complete`.
    pub fn persist<T, C, E>(&self, instance: T, on_complete: C, on_error: E) -> Result<(), TickError>
    where
        T: Mapped,
        C: FnOnce(T) + Send + 'static,
        E: FnOnce(TickError) + Send + 'static,
    {
        self.resume::<T, _>(move |orm, blocked| match blocked {
            Some(e) => on_error(e),
            None => orm.persist_now(instance, on_complete, OnceCallback::new(on_error)),
        })
    }

    fn persist_now<T, C>(&self, instance: T, on_complete: C, on_error: OnceCallback<TickError>)
    where
        T: Mapped,
        C: FnOnce(T) + Send + 'static,
    {
        let prepared = self.mapping::<T>().and_then(|mapping| {
            let key = mapping.key_value(&instance)?;
            let row = mapping.to_row(&instance)?;
            let probe = mapping.table().select_by_key(key.clone())?;
            Ok((mapping, key, row, probe))
        });
        let (mapping, key, row, probe) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.fail_on_host(on_error, e),
        };

        let conn = self.conn.clone();
        let fail = on_error.clone();
        let submitted = self.conn.fetch_raw(probe, move |existing| {
            let existing = match existing {
                Ok(rows) => rows,
                Err(e) => return fail.call(e.into()),
            };
            let done = fail.clone();
            let submitted = if existing.is_empty() {
                let backfill = mapping.key_is_auto_increment() && !mapping.is_assigned(&key);
                let stmt = mapping.table().insert(row);
                conn.insert_raw(stmt, move |inserted| {
                    let mut instance = instance;
                    let id = match inserted {
                        Ok(id) => id,
                        Err(e) => return done.call(e.into()),
                    };
                    if backfill
                        && let Some(id) = id
                        && let Err(e) = mapping.set_key(&mut instance, id)
                    {
                        return done.call(e);
                    }
                    on_complete(instance);
                })
            } else {
                conn.execute_raw(mapping.table().replace(row), move |replaced| match replaced {
                    Ok(_) => on_complete(instance),
                    Err(e) => done.call(e.into()),
                })
            };
            if let Err(e) = submitted {
                fail.call(e);
            }
        });
        if let Err(e) = submitted {
            self.fail_on_host(on_error, e);
        }
    }

    /// Load every row of `T`'s table, optionally filtered by a raw `WHERE`
    /// condition, and hand the instances to `supplier`.
    pub fn get_entries<T, S, E>(
        &self,
        condition: Option<String>,
        supplier: S,
        on_error: E,
    ) -> Result<(), TickError>
    where
        T: Mapped,
        S: FnOnce(Vec<T>) + Send + 'static,
        E: FnOnce(TickError) + Send + 'static,
    {
        self.resume::<T, _>(move |orm, blocked| match blocked {
            Some(e) => on_error(e),
            None => orm.get_entries_now(condition, supplier, OnceCallback::new(on_error)),
        })
    }

    fn get_entries_now<T, S>(
        &self,
        condition: Option<String>,
        supplier: S,
        on_error: OnceCallback<TickError>,
    ) where
        T: Mapped,
        S: FnOnce(Vec<T>) + Send + 'static,
    {
        let mapping = match self.mapping::<T>() {
            Ok(mapping) => mapping,
            Err(e) => return self.fail_on_host(on_error, e),
        };
        let stmt = mapping.table().select_all(condition.as_deref());
        let fail = on_error.clone();
        let submitted = self.conn.fetch_raw(stmt, move |rows| {
            let entries = rows.map_err(TickError::from).and_then(|rows| {
                rows.into_iter()
                    .map(|row| mapping.from_row(row))
                    .collect::<Result<Vec<T>, _>>()
            });
            match entries {
                Ok(entries) => supplier(entries),
                Err(e) => fail.call(e),
            }
        });
        if let Err(e) = submitted {
            self.fail_on_host(on_error, e);
        }
    }

    /// Delete the row with `instance`'s key. Returns `Ok(false)` without
    /// doing anything when the key is unassigned.
    pub fn delete_entry<T, C, E>(
        &self,
        instance: &T,
        on_complete: C,
        on_error: E,
    ) -> Result<bool, TickError>
    where
        T: Mapped,
        C: FnOnce(u64) + Send + 'static,
        E: FnOnce(TickError) + Send + 'static,
    {
        let mapping = self.mapping::<T>()?;
        let key = mapping.key_value(instance)?;
        if !mapping.is_assigned(&key) {
            debug!(ty = type_name::<T>(), "delete skipped; key unassigned");
            return Ok(false);
        }
        self.resume::<T, _>(move |orm, blocked| match blocked {
            Some(e) => on_error(e),
            None => orm.delete_now::<T, _>(key, on_complete, OnceCallback::new(on_error)),
        })?;
        Ok(true)
    }

    fn delete_now<T, C>(&self, key: Value, on_complete: C, on_error: OnceCallback<TickError>)
    where
        T: Mapped,
        C: FnOnce(u64) + Send + 'static,
    {
        let stmt = match self
            .mapping::<T>()
            .and_then(|mapping| mapping.table().delete_by_key(key))
        {
            Ok(stmt) => stmt,
            Err(e) => return self.fail_on_host(on_error, e),
        };
        let fail = on_error.clone();
        let submitted = self.conn.execute_raw(stmt, move |deleted| match deleted {
            Ok(n) => on_complete(n),
            Err(e) => fail.call(e.into()),
        });
        if let Err(e) = submitted {
            self.fail_on_host(on_error, e);
        }
    }
}
