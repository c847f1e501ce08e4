use pg_query_watch::connection::postgres::connect;
use pg_query_watch::watcher::{QueryEvent, Subscription, Watcher};
use tokio_postgres::NoTls;

// Simple example which watches two overlapping queries on the same table
// while a writer mutates it. Expected output is the initial snapshot of
// each watcher followed by the per-row effects of the writer's statements:
// ```
// [above-1] ready
// [below-3] ready
// [above-1] + ...: [2]
// ...
// ```
// Set PG_QUERY_WATCH_DSN to point at a database you can create tables in.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dsn = std::env::var("PG_QUERY_WATCH_DSN")
        .unwrap_or_else(|_| "host=localhost user=postgres".to_string());

    let (client, notifications) = connect(&dsn, NoTls).await.unwrap();
    let watcher = Watcher::new(client, notifications).await.unwrap();

    let (writer, connection) = tokio_postgres::connect(&dsn, NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    writer
        .batch_execute(
            "DROP TABLE IF EXISTS qw_demo;
             CREATE TABLE qw_demo (a int);
             INSERT INTO qw_demo VALUES (1), (2), (3)",
        )
        .await
        .unwrap();

    let above = watcher.watch("SELECT a FROM qw_demo WHERE a > 1");
    let below = watcher.watch("SELECT a FROM qw_demo WHERE a < 3");

    let consumers = [("above-1", above), ("below-3", below)]
        .into_iter()
        .map(|(name, subscription)| tokio::spawn(consume(name, subscription)))
        .collect::<Vec<_>>();

    for statement in [
        "INSERT INTO qw_demo VALUES (0)",
        "UPDATE qw_demo SET a = 4 WHERE a = 2",
        "DELETE FROM qw_demo WHERE a = 3",
    ] {
        writer.batch_execute(statement).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    for consumer in consumers {
        consumer.abort();
        let _ = consumer.await;
    }
}

async fn consume(name: &'static str, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            QueryEvent::Ready => println!("[{name}] ready"),
            QueryEvent::Insert { id, data } => println!("[{name}] + {id}: {data}"),
            QueryEvent::Update { id, data } => println!("[{name}] ~ {id}: {data}"),
            QueryEvent::Delete { id } => println!("[{name}] - {id}"),
            QueryEvent::Changes { rows, cols } => {
                println!("[{name}] batch of {} over {cols:?}", rows.len());
            }
            QueryEvent::Error(e) => {
                eprintln!("[{name}] error: {e}");
                return;
            }
        }
    }
}
