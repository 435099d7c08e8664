use mimalloc::MiMalloc;
use tickdb::orm::codec;
use tickdb::{
    Config, Connection, FieldDef, FieldKind, Mapped, ObjectRelationalMapper, TableBuilder,
    TickError,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Default)]
struct PlayerRecord {
    id: i64,
    name: String,
    online: bool,
    homes: Vec<String>,
}

impl Mapped for PlayerRecord {
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
            FieldDef::new("homes", FieldKind::Structured),
            |p| codec::structured(&p.homes),
            |p, v| {
                p.homes = codec::from_structured(v)?;
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database = %cfg.database.kind,
        data_dir = %cfg.data_dir.display(),
        resource_dir = %cfg.resource_dir.as_ref().map(|p| p.display().to_string()).unwrap_or("<none>".into()),
        loglevel = %cfg.loglevel,
        policy = ?cfg.orm.policy
    );

    let dispatcher = tickdb::service::dispatcher::spawn(cfg.dispatch).await?;
    let conn = Connection::from_config(&cfg, dispatcher.clone()).await?;
    let orm = ObjectRelationalMapper::new(conn.clone(), cfg.orm);

    let (mapped_tx, mapped_rx) = oneshot::channel();
    orm.map_with::<PlayerRecord, _>("1.0", None, move |outcome| {
        let _ = mapped_tx.send(outcome);
    })?;

    let player = PlayerRecord {
        name: "steve".to_string(),
        online: true,
        homes: vec!["spawn".to_string()],
        ..Default::default()
    };
    let (stored_tx, stored_rx) = oneshot::channel();
    orm.persist(
        player,
        move |p| {
            info!(id = p.id, name = %p.name, "player stored");
            let _ = stored_tx.send(());
        },
        |e| error!(error = %e, "failed to store player"),
    )?;

    if let Err(e) = mapped_rx.await? {
        warn!(error = %e, "players table is not usable");
        dispatcher.flush().await?;
        return Ok(());
    }
    if stored_rx.await.is_err() {
        warn!("player was not stored");
    }

    let (rows_tx, rows_rx) = oneshot::channel();
    orm.get_entries::<PlayerRecord, _, _>(
        Some("online = 1".to_string()),
        move |players| {
            let _ = rows_tx.send(players);
        },
        |e| error!(error = %e, "failed to load players"),
    )?;
    match rows_rx.await {
        Ok(players) => info!(count = players.len(), ?players, "online players"),
        Err(_) => warn!("player query did not complete"),
    }

    dispatcher.flush().await?;
    dispatcher.stop();
    Ok(())
}
