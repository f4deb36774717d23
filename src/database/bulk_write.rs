use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::probe::ServerRecord;

/// sqlite refuses statements with more parameters than this.
const SQLITE_BIND_LIMIT: usize = 32766;

/// Every column we write, in the order they're bound.
const COLUMNS: &[&str] = &[
    "ip",
    "port",
    "version_name",
    "protocol",
    "motd",
    "players_online",
    "players_max",
    "icon",
    "whitelist",
    "secure_chat",
    "software",
    "mods",
    "plugins",
    "rcon_open",
    "timestamp",
];

#[derive(Debug, thiserror::Error)]
pub enum BulkWriteError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("couldn't serialize mods or plugins: {0}")]
    Json(#[from] serde_json::Error),
}

/// Insert or update every record in one transaction. A server we already know
/// about (same ip and port) has all of its columns replaced.
pub async fn upsert_servers(pool: &SqlitePool, records: &[ServerRecord]) -> Result<(), BulkWriteError> {
    if records.is_empty() {
        return Ok(());
    }

    let rows_per_statement = SQLITE_BIND_LIMIT / COLUMNS.len();

    let mut tx = pool.begin().await?;
    for chunk in records.chunks(rows_per_statement) {
        let encoded = chunk
            .iter()
            .map(|r| Ok((serde_json::to_string(&r.mods)?, serde_json::to_string(&r.plugins)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let mut qb = upsert_query(chunk, encoded);
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(())
}

fn upsert_query<'a>(
    records: &'a [ServerRecord],
    encoded: Vec<(String, String)>,
) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new("INSERT INTO servers (");
    qb.push(COLUMNS.join(", "));
    qb.push(") ");

    qb.push_values(records.iter().zip(encoded), |mut b, (r, (mods, plugins))| {
        b.push_bind(r.ip.to_string())
            .push_bind(r.port as i32)
            .push_bind(r.version_name.clone())
            .push_bind(r.protocol)
            .push_bind(r.motd.clone())
            .push_bind(r.players_online)
            .push_bind(r.players_max)
            .push_bind(r.favicon.clone())
            .push_bind(r.is_whitelisted)
            .push_bind(r.enforces_secure_chat)
            .push_bind(r.software.clone())
            .push_bind(mods)
            .push_bind(plugins)
            .push_bind(r.rcon_open)
            .push_bind(r.timestamp);
    });

    qb.push(" ON CONFLICT (ip, port) DO UPDATE SET ");
    let mut first = true;
    for name in COLUMNS {
        if *name == "ip" || *name == "port" {
            continue;
        }
        if first {
            first = false;
        } else {
            qb.push(", ");
        }
        qb.push(name);
        qb.push(" = excluded.");
        qb.push(name);
    }

    qb
}
