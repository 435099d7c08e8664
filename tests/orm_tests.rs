use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tickdb::config::{ConnectSettings, DispatchSettings, OrmSettings, ReconcilePolicy};
use tickdb::orm::{MigrationPlan, Migrator, VERSION_COLUMN, codec};
use tickdb::service::dispatcher;
use tickdb::{
    Connection, Credentials, Dispatcher, FieldDef, FieldKind, Mapped, MappingState,
    ObjectRelationalMapper, QueryResources, Row, TableBuilder, TickError, Value,
};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Stats {
    kills: u32,
    deaths: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Player {
    id: i64,
    name: String,
    online: bool,
    level: i64,
    homes: Vec<String>,
    stats: Stats,
}

impl Player {
    fn named(name: &str) -> Self {
        Player {
            name: name.to_string(),
            level: 1,
            ..Default::default()
        }
    }
}

impl Mapped for Player {
    fn table_name() -> String {
        "players".to_string()
    }

    fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
        t.field(
            FieldDef::new("id", FieldKind::Integer)
                .primary_key()
                .auto_increment(),
            |p| Ok(p.id.into()),
            |p, v| {
                p.id = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("name", FieldKind::Text).size(16),
            |p| Ok(p.name.clone().into()),
            |p, v| {
                p.name = v.into_string().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("online", FieldKind::Bool).default(false),
            |p| Ok(p.online.into()),
            |p, v| {
                p.online = v.as_bool().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("level", FieldKind::Integer).default(1),
            |p| Ok(p.level.into()),
            |p, v| {
                p.level = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("homes", FieldKind::Structured).nullable(),
            |p| codec::structured(&p.homes),
            |p, v| {
                p.homes = if v.is_null() {
                    Vec::new()
                } else {
                    codec::from_structured(v)?
                };
                Ok(())
            },
        )?
        .field(
            FieldDef::new("stats", FieldKind::Opaque).nullable(),
            |p| codec::opaque(&p.stats),
            |p, v| {
                p.stats = if v.is_null() {
                    Stats::default()
                } else {
                    codec::from_opaque(v)?
                };
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Account {
    uuid: String,
    balance: f64,
    frozen: bool,
}

impl Mapped for Account {
    fn table_name() -> String {
        "accounts".to_string()
    }

    fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
        t.field(
            FieldDef::new("uuid", FieldKind::Text).size(36).primary_key(),
            |a| Ok(a.uuid.clone().into()),
            |a, v| {
                a.uuid = v.into_string().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("balance", FieldKind::Float).default(0.0),
            |a| Ok(a.balance.into()),
            |a, v| {
                a.balance = v.as_f64().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("frozen", FieldKind::Bool).default(false),
            |a| Ok(a.frozen.into()),
            |a, v| {
                a.frozen = v.as_bool().unwrap_or_default();
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Hero {
    id: i64,
    name: String,
    kills: i64,
}

impl Mapped for Hero {
    fn table_name() -> String {
        "heroes".to_string()
    }

    fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
        t.field(
            FieldDef::new("id", FieldKind::Integer).primary_key(),
            |h| Ok(h.id.into()),
            |h, v| {
                h.id = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("name", FieldKind::Text),
            |h| Ok(h.name.clone().into()),
            |h, v| {
                h.name = v.into_string().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("kills", FieldKind::Integer),
            |h| Ok(h.kills.into()),
            |h, v| {
                h.kills = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledger {
    id: i64,
    amount: i64,
}

impl Mapped for Ledger {
    fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
        t.field(
            FieldDef::new("id", FieldKind::Integer).primary_key(),
            |l| Ok(l.id.into()),
            |l, v| {
                l.id = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?
        .field(
            FieldDef::new("amount", FieldKind::Integer),
            |l| {
                if l.amount < 0 {
                    return Err(TickError::invalid_value("amount", "negative"));
                }
                Ok(l.amount.into())
            },
            |l, v| {
                l.amount = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Unmapped {
    id: i64,
}

impl Mapped for Unmapped {
    fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
        t.field(
            FieldDef::new("id", FieldKind::Integer).primary_key(),
            |u| Ok(u.id.into()),
            |u, v| {
                u.id = v.as_i64().unwrap_or_default();
                Ok(())
            },
        )?;
        Ok(())
    }
}

struct World {
    _dir: TempDir,
    dispatcher: Dispatcher,
    conn: Connection,
    orm: ObjectRelationalMapper,
}

async fn world(settings: OrmSettings) -> World {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher::spawn(DispatchSettings::default()).await.unwrap();
    let conn = Connection::open(
        Credentials::sqlite(dir.path().join("world.sqlite")),
        &QueryResources::default(),
        dispatcher.clone(),
        ConnectSettings::default(),
    )
    .await;
    let orm = ObjectRelationalMapper::new(conn.clone(), settings);
    World {
        _dir: dir,
        dispatcher,
        conn,
        orm,
    }
}

async fn map<T: Mapped>(
    orm: &ObjectRelationalMapper,
    version: &str,
    migrator: Option<Arc<dyn Migrator>>,
) -> Result<(), TickError> {
    let (tx, rx) = oneshot::channel();
    orm.map_with::<T, _>(version, migrator, move |outcome| {
        let _ = tx.send(outcome);
    })?;
    rx.await.unwrap()
}

async fn persist<T: Mapped>(orm: &ObjectRelationalMapper, value: T) -> Result<T, TickError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let fail = tx.clone();
    orm.persist(
        value,
        move |stored| {
            let _ = tx.send(Ok(stored));
        },
        move |e| {
            let _ = fail.send(Err(e));
        },
    )?;
    rx.recv().await.unwrap()
}

async fn entries<T: Mapped>(
    orm: &ObjectRelationalMapper,
    condition: Option<&str>,
) -> Result<Vec<T>, TickError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let fail = tx.clone();
    orm.get_entries::<T, _, _>(
        condition.map(str::to_string),
        move |found| {
            let _ = tx.send(Ok(found));
        },
        move |e| {
            let _ = fail.send(Err(e));
        },
    )?;
    rx.recv().await.unwrap()
}

async fn raw_rows(conn: &Connection, sql: &str) -> Vec<Row> {
    let (tx, rx) = oneshot::channel();
    conn.fetch_raw(sql, move |rows| {
        let _ = tx.send(rows);
    })
    .unwrap();
    rx.await.unwrap().unwrap()
}

async fn live_columns(conn: &Connection, table: &str) -> Vec<String> {
    let (tx, rx) = oneshot::channel();
    conn.introspect_columns(table, move |cols| {
        let _ = tx.send(cols);
    })
    .unwrap();
    rx.await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn created_table_matches_mapped_columns() {
    let w = world(OrmSettings::default()).await;

    map::<Player>(&w.orm, "1.0", None).await.unwrap();

    assert_eq!(w.orm.state::<Player>(), Some(MappingState::Mapped));
    let table = w.orm.table::<Player>().unwrap();
    assert_eq!(live_columns(&w.conn, "players").await, table.column_names());
    assert_eq!(
        table.column_names(),
        vec!["id", "name", "online", "level", "homes", "stats", VERSION_COLUMN]
    );
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn persist_inserts_then_replaces() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();

    let mut steve = Player::named("steve");
    steve.homes = vec!["spawn".into(), "mine".into()];
    steve.stats = Stats { kills: 3, deaths: 1 };
    let steve = persist(&w.orm, steve).await.unwrap();
    assert_eq!(steve.id, 1);

    let alex = persist(&w.orm, Player::named("alex")).await.unwrap();
    assert_eq!(alex.id, 2);

    let mut renamed = steve.clone();
    renamed.name = "steve2".into();
    renamed.online = true;
    let renamed = persist(&w.orm, renamed).await.unwrap();
    assert_eq!(renamed.id, 1);

    let mut stored = entries::<Player>(&w.orm, None).await.unwrap();
    stored.sort_by_key(|p| p.id);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0], renamed);
    assert_eq!(stored[1], alex);

    let rows = raw_rows(&w.conn, "SELECT __version FROM players").await;
    assert!(
        rows.iter()
            .all(|r| r.get(VERSION_COLUMN) == Some(&Value::from("1.0")))
    );
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn get_entries_coerces_stored_values() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();

    let (tx, rx) = oneshot::channel();
    w.conn
        .batch_execute(
            [
                "INSERT INTO players (name, online, homes) VALUES ('raw', 1, '[\"a\",\"b\"]')",
                "INSERT INTO players (name, online, level, homes) VALUES ('nulls', 0, 7, NULL)",
            ],
            move |r| {
                let _ = tx.send(r);
            },
        )
        .unwrap();
    rx.await.unwrap().unwrap();

    let online = entries::<Player>(&w.orm, Some("online = 1")).await.unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].name, "raw");
    assert!(online[0].online);
    assert_eq!(online[0].level, 1);
    assert_eq!(online[0].homes, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(online[0].stats, Stats::default());

    let offline = entries::<Player>(&w.orm, Some("name = 'nulls'")).await.unwrap();
    assert_eq!(offline[0].level, 7);
    assert!(!offline[0].online);
    assert!(offline[0].homes.is_empty());

    let bad = entries::<Player>(&w.orm, Some("no_such_column = 1")).await;
    assert!(matches!(bad, Err(TickError::Database(_))));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_entry_removes_by_key() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();

    let never_stored = Player::named("ghost");
    let submitted = w
        .orm
        .delete_entry(&never_stored, |_| panic!("nothing to delete"), |_| {})
        .unwrap();
    assert!(!submitted);

    let steve = persist(&w.orm, Player::named("steve")).await.unwrap();
    let (tx, rx) = oneshot::channel();
    let submitted = w
        .orm
        .delete_entry(
            &steve,
            move |n| {
                let _ = tx.send(n);
            },
            |e| panic!("delete failed: {e}"),
        )
        .unwrap();
    assert!(submitted);
    assert_eq!(rx.await.unwrap(), 1);
    assert!(entries::<Player>(&w.orm, None).await.unwrap().is_empty());
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_on_unmapped_types_fail() {
    let w = world(OrmSettings::default()).await;

    let err = w
        .orm
        .persist(Unmapped { id: 1 }, |_| {}, |_| {})
        .unwrap_err();
    assert!(matches!(err, TickError::NotMapped(_)));
    assert!(w.orm.state::<Unmapped>().is_none());
    assert!(matches!(
        w.orm.delete_entry(&Unmapped { id: 1 }, |_| {}, |_| {}),
        Err(TickError::NotMapped(_))
    ));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn persists_issued_while_reconciling_resume_in_order() {
    let w = world(OrmSettings::default()).await;
    let (mapped_tx, mapped_rx) = oneshot::channel();
    w.orm
        .map_with::<Player, _>("1.0", None, move |outcome| {
            let _ = mapped_tx.send(outcome);
        })
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for name in ["first", "second"] {
        let tx = tx.clone();
        w.orm
            .persist(
                Player::named(name),
                move |p| tx.send(p).unwrap(),
                |e| panic!("persist failed: {e}"),
            )
            .unwrap();
    }

    mapped_rx.await.unwrap().unwrap();
    let a = rx.recv().await.unwrap();
    let b = rx.recv().await.unwrap();
    assert_eq!((a.name.as_str(), b.name.as_str()), ("first", "second"));
    assert!(a.id > 0 && b.id > 0 && a.id != b.id);
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remapping_while_reconciling_is_rejected() {
    let w = world(OrmSettings::default()).await;
    let (tx, rx) = oneshot::channel();
    w.orm
        .map_with::<Player, _>("1.0", None, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    let err = w.orm.map::<Player>("1.0", None).unwrap_err();
    assert!(matches!(err, TickError::ReconcileInProgress(table) if table == "players"));

    rx.await.unwrap().unwrap();
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn mapping_again_at_same_version_keeps_data() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    persist(&w.orm, Player::named("steve")).await.unwrap();

    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    assert_eq!(w.orm.state::<Player>(), Some(MappingState::Mapped));
    assert_eq!(entries::<Player>(&w.orm, None).await.unwrap().len(), 1);

    // A fresh mapper sees the stored rows at the same version and keeps them.
    let fresh = ObjectRelationalMapper::new(w.conn.clone(), OrmSettings::default());
    map::<Player>(&fresh, "1.0", None).await.unwrap();
    assert_eq!(entries::<Player>(&fresh, None).await.unwrap().len(), 1);
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_table_is_rebuilt_with_current_structure() {
    let w = world(OrmSettings::default()).await;
    w.conn
        .execute_blocking("CREATE TABLE players (id INTEGER PRIMARY KEY, legacy TEXT)")
        .await
        .unwrap();

    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    let table = w.orm.table::<Player>().unwrap();
    assert_eq!(live_columns(&w.conn, "players").await, table.column_names());
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test]
async fn persist_errors_found_before_submitting_arrive_through_the_host() {
    let w = world(OrmSettings::default()).await;
    map::<Ledger>(&w.orm, "1.0", None).await.unwrap();

    let reported = Arc::new(AtomicBool::new(false));
    let flag = reported.clone();
    let (tx, rx) = oneshot::channel();
    w.orm
        .persist(
            Ledger { id: 1, amount: -5 },
            |_| panic!("must not be stored"),
            move |e| {
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(e);
            },
        )
        .unwrap();
    assert!(!reported.load(Ordering::SeqCst));

    assert!(matches!(
        rx.await.unwrap(),
        TickError::InvalidValue { column, .. } if column == "amount"
    ));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn version_change_without_migrator_fails_and_keeps_data() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    persist(&w.orm, Player::named("steve")).await.unwrap();

    let err = map::<Player>(&w.orm, "2.0", None).await.unwrap_err();
    assert!(matches!(
        &err,
        TickError::MissingMigrator { stored, current, .. } if stored == "1.0" && current == "2.0"
    ));
    assert!(matches!(
        w.orm.state::<Player>(),
        Some(MappingState::Failed { .. })
    ));

    let blocked = persist(&w.orm, Player::named("alex")).await;
    assert!(matches!(blocked, Err(TickError::ReconciliationFailed { .. })));

    let rows = raw_rows(&w.conn, "SELECT name, __version FROM players").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::from("steve")));
    assert_eq!(rows[0].get(VERSION_COLUMN), Some(&Value::from("1.0")));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_operations_fail_when_reconciliation_fails() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    persist(&w.orm, Player::named("steve")).await.unwrap();

    let (mapped_tx, mapped_rx) = oneshot::channel();
    w.orm
        .map_with::<Player, _>("2.0", None, move |outcome| {
            let _ = mapped_tx.send(outcome);
        })
        .unwrap();
    let (tx, rx) = oneshot::channel();
    w.orm
        .persist(
            Player::named("alex"),
            |_| panic!("must not be stored"),
            move |e| {
                let _ = tx.send(e);
            },
        )
        .unwrap();

    assert!(mapped_rx.await.unwrap().is_err());
    assert!(matches!(
        rx.await.unwrap(),
        TickError::ReconciliationFailed { table, .. } if table == "players"
    ));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transform_migration_rewrites_rows() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    persist(&w.orm, Player::named("steve")).await.unwrap();
    persist(&w.orm, Player::named("banned")).await.unwrap();

    let migrator: Arc<dyn Migrator> = Arc::new(|from: &str, to: &str| {
        assert_eq!((from, to), ("1.0", "2.0"));
        MigrationPlan::transform(|mut row: Row| {
            let name = row.get("name")?.as_str()?.to_string();
            if name == "banned" {
                return None;
            }
            row.insert("name", name.to_uppercase());
            row.insert("level", 10);
            Some(row)
        })
    });
    map::<Player>(&w.orm, "2.0", Some(migrator)).await.unwrap();

    let players = entries::<Player>(&w.orm, None).await.unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].name, "STEVE");
    assert_eq!(players[0].level, 10);
    assert_eq!(players[0].id, 1);

    let rows = raw_rows(&w.conn, "SELECT __version FROM players").await;
    assert_eq!(rows[0].get(VERSION_COLUMN), Some(&Value::from("2.0")));
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn statement_migration_runs_after_rebuild() {
    let w = world(OrmSettings::default()).await;
    map::<Player>(&w.orm, "1.0", None).await.unwrap();
    persist(&w.orm, Player::named("steve")).await.unwrap();

    let migrator: Arc<dyn Migrator> = Arc::new(|_: &str, to: &str| {
        MigrationPlan::statements([format!(
            "INSERT INTO players (name, online, level, __version) VALUES ('seeded', 0, 5, '{to}')"
        )])
    });
    map::<Player>(&w.orm, "2.0", Some(migrator)).await.unwrap();

    let players = entries::<Player>(&w.orm, None).await.unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].name, "seeded");
    assert_eq!(players[0].level, 5);
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn column_diff_policy_alters_in_place() {
    let w = world(OrmSettings {
        policy: ReconcilePolicy::ColumnDiff,
        wait_timeout_ms: None,
    })
    .await;
    w.conn
        .execute_blocking(
            "CREATE TABLE accounts (uuid VARCHAR(36) NOT NULL PRIMARY KEY, \
             balance DOUBLE NOT NULL DEFAULT 0, legacy TEXT)",
        )
        .await
        .unwrap();
    w.conn
        .execute_blocking("INSERT INTO accounts (uuid, balance, legacy) VALUES ('a-1', 12.5, 'x')")
        .await
        .unwrap();

    map::<Account>(&w.orm, "1.0", None).await.unwrap();

    let mut live = live_columns(&w.conn, "accounts").await;
    live.sort();
    let mut expected = w.orm.table::<Account>().unwrap().column_names();
    expected.sort();
    assert_eq!(live, expected);

    let accounts = entries::<Account>(&w.orm, None).await.unwrap();
    assert_eq!(
        accounts,
        vec![Account {
            uuid: "a-1".into(),
            balance: 12.5,
            frozen: false,
        }]
    );

    let unsaved = Account::default();
    assert!(!w.orm.delete_entry(&unsaved, |_| {}, |_| {}).unwrap());

    let updated = persist(
        &w.orm,
        Account {
            uuid: "a-1".into(),
            balance: 20.0,
            frozen: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(entries::<Account>(&w.orm, None).await.unwrap(), vec![updated]);
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn column_diff_policy_adds_plain_fields_to_populated_table() {
    let w = world(OrmSettings {
        policy: ReconcilePolicy::ColumnDiff,
        wait_timeout_ms: None,
    })
    .await;
    w.conn
        .execute_blocking("CREATE TABLE heroes (id BIGINT NOT NULL PRIMARY KEY, __version VARCHAR(36))")
        .await
        .unwrap();
    w.conn
        .execute_blocking("INSERT INTO heroes (id, __version) VALUES (7, '1.0')")
        .await
        .unwrap();

    map::<Hero>(&w.orm, "1.0", None).await.unwrap();
    assert_eq!(w.orm.state::<Hero>(), Some(MappingState::Mapped));

    let heroes = entries::<Hero>(&w.orm, None).await.unwrap();
    assert_eq!(
        heroes,
        vec![Hero {
            id: 7,
            name: String::new(),
            kills: 0,
        }]
    );

    let renamed = persist(
        &w.orm,
        Hero {
            id: 7,
            name: "arthas".into(),
            kills: 3,
        },
    )
    .await
    .unwrap();
    assert_eq!(entries::<Hero>(&w.orm, None).await.unwrap(), vec![renamed]);
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn column_diff_policy_creates_missing_table() {
    let w = world(OrmSettings {
        policy: ReconcilePolicy::ColumnDiff,
        wait_timeout_ms: None,
    })
    .await;

    map::<Account>(&w.orm, "1.0", None).await.unwrap();
    assert_eq!(
        live_columns(&w.conn, "accounts").await,
        w.orm.table::<Account>().unwrap().column_names()
    );
    w.dispatcher.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_operation_times_out() {
    let w = world(OrmSettings {
        policy: ReconcilePolicy::Versioned,
        wait_timeout_ms: Some(50),
    })
    .await;

    // Hold the host thread so reconciliation cannot progress past its probe.
    w.dispatcher
        .run_on_host(|| std::thread::sleep(Duration::from_millis(300)))
        .unwrap();
    let (mapped_tx, mapped_rx) = oneshot::channel();
    w.orm
        .map_with::<Player, _>("1.0", None, move |outcome| {
            let _ = mapped_tx.send(outcome);
        })
        .unwrap();

    let (tx, rx) = oneshot::channel();
    w.orm
        .persist(
            Player::named("late"),
            |_| panic!("must time out"),
            move |e| {
                let _ = tx.send(e);
            },
        )
        .unwrap();

    assert!(matches!(
        rx.await.unwrap(),
        TickError::ReconcileTimeout { table, .. } if table == "players"
    ));
    mapped_rx.await.unwrap().unwrap();
    assert!(entries::<Player>(&w.orm, None).await.unwrap().is_empty());
    w.dispatcher.flush().await.unwrap();
}
