//! Loads "users" by id through a batching loader and shows the N+1 problem
//! going away.
//!
//! Run with `RUST_LOG=dataloader=debug cargo run --example user_loader` to see
//! every flush decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dataloader::{BatchFn, BatchResult, FetchContext, FetchError, Loader, LoaderConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct User {
    id: u64,
    name: String,
}

/// Stand-in for a relational table, queried with `WHERE id IN (...)`.
struct UserTable {
    rows: HashMap<u64, User>,
    queries: AtomicUsize,
}

impl UserTable {
    fn seeded(count: u64) -> Self {
        let rows = (1..=count)
            .map(|id| {
                (
                    id,
                    User {
                        id,
                        name: format!("user-{id}"),
                    },
                )
            })
            .collect();
        Self {
            rows,
            queries: AtomicUsize::new(0),
        }
    }
}

struct UsersById(Arc<UserTable>);

impl BatchFn<u64, User> for UsersById {
    async fn load(&self, ctx: FetchContext, ids: Vec<u64>) -> BatchResult<User> {
        self.0.queries.fetch_add(1, Ordering::Relaxed);
        info!(generation = ctx.generation(), ids = ?ids, "SELECT * FROM users WHERE id IN (...)");

        // Simulated round trip.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
            _ = ctx.cancelled() => return Err(FetchError::msg("query cancelled")),
        }

        Ok(ids
            .iter()
            .map(|id| self.0.rows.get(id).cloned().ok_or(FetchError::NotFound))
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let table = Arc::new(UserTable::seeded(50));
    let config = LoaderConfig::default().with_max_batch_size(25);
    let users = Loader::with_config(UsersById(Arc::clone(&table)), config)?;

    // 100 "posts", each resolving its author: naively 100 queries.
    let mut tasks = Vec::new();
    for post in 0..100u64 {
        let users = users.clone();
        tasks.push(tokio::spawn(async move {
            let author = post % 60 + 1;
            (post, users.load(author).await)
        }));
    }

    let mut missing = 0;
    for task in tasks {
        let (post, author) = task.await?;
        match author {
            Ok(user) => tracing::debug!(post, author = user.id, name = %user.name, "resolved"),
            Err(_) => missing += 1,
        }
    }

    let queries = table.queries.load(Ordering::Relaxed);
    info!(queries, missing, "resolved 100 posts");
    println!("{}", serde_json::to_string_pretty(&users.stats())?);
    Ok(())
}
