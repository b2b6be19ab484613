/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Development CLI for the replica engine. Run one process as the server
//! (`--serve`) and any number of others as replicas against it, then poke
//! at the operator surface while watching the sync events scroll by.

#![warn(rust_2018_idioms)]

use anyhow::Result;
use replica::supervisor::{SyncSupervisor, TcpConnector};
use replica::ReplicaStore;
use serde_json::json;
use std::io::Write as _;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::channel;
use std::sync::Arc;
use structopt::StructOpt;
use types::Timestamp;
use walsync::messages::{Change, Op};
use walsync::server::{memory::MemoryBackend, ReplicationHub, ServerStore, WalTail};
use walsync::Settings;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "replica_sync", about = "CLI for the replication sync engine")]
pub struct Opts {
    /// Address of the sync server to connect (or serve on).
    #[structopt(long, short = "a", default_value = "127.0.0.1:7654")]
    pub addr: SocketAddr,

    /// Path to the replica database.
    #[structopt(long, short = "d", default_value = "./replica-sync.db")]
    pub db_path: String,

    /// Run the in-memory development server instead of a replica.
    #[structopt(long)]
    pub serve: bool,
}

fn prompt_char(msg: &str) -> Option<char> {
    print!("{}: ", msg);
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    line.trim().chars().next()
}

fn serve(addr: SocketAddr) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    for (pk, name) in [("u-1", "ann"), ("u-2", "bob"), ("u-3", "cyd")] {
        backend.write(
            Op::Insert,
            "users",
            json!({ "id": pk, "name": name, "updated_at": 1 }),
            Timestamp::now(),
        );
    }
    log::info!("seeded 3 users; WAL at {}", backend.current_lsn()?);

    // A background writer so connected replicas have live traffic to chew
    // on.
    let writer = Arc::clone(&backend);
    std::thread::spawn(move || {
        let mut n = 0u32;
        loop {
            std::thread::sleep(std::time::Duration::from_secs(15));
            n += 1;
            let now = Timestamp::now();
            let lsn = writer.write(
                Op::Insert,
                "tasks",
                json!({
                    "id": format!("server-task-{}", n),
                    "title": format!("background task #{}", n),
                    "updated_at": now.as_millis(),
                }),
                now,
            );
            log::info!("server wrote task #{} at {}", n, lsn);
        }
    });

    let hub = Arc::new(ReplicationHub::new(
        Arc::clone(&backend) as Arc<dyn ServerStore>,
        backend as Arc<dyn WalTail>,
        Settings::default(),
    ));
    hub.ensure_started()?;
    let listener = TcpListener::bind(addr)?;
    log::info!("serving sync on {}", addr);
    hub.serve(listener)?;
    Ok(())
}

fn list_tasks(store: &ReplicaStore) -> Result<()> {
    let storage = store.storage.lock();
    let rows: Vec<(String, String)> = {
        let mut stmt = storage
            .conn()
            .prepare("SELECT pk, data FROM \"tasks\" ORDER BY pk")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    println!("--------------------------------");
    println!("applied LSN: {}", storage.applied_lsn()?);
    for (pk, data) in rows {
        println!("> {} - {}", pk, data);
    }
    println!("--------------------------------");
    Ok(())
}

fn run_replica(opts: &Opts) -> Result<()> {
    let store = Arc::new(ReplicaStore::new(&opts.db_path)?);
    log::info!("replica identity: {}", store.client_id()?);

    let (events_tx, events_rx) = channel();
    let supervisor = SyncSupervisor::new(
        Arc::clone(&store),
        TcpConnector { addr: opts.addr },
        Settings::default(),
        events_tx,
    );
    let control = supervisor.control();
    std::thread::spawn(move || supervisor.run());
    std::thread::spawn(move || {
        for event in events_rx {
            println!("[event] {:?}", event);
        }
    });

    loop {
        match prompt_char(
            "[A]dd a task, [L]ist tasks, [P]ending, [R]etry failed, \
             [O]ffline toggle, Reset [Z] LSN, [D]rop state or [Q]uit",
        )
        .unwrap_or('?')
        {
            'A' | 'a' => {
                let now = Timestamp::now();
                let pk = uuid::Uuid::new_v4().to_string();
                let change = Change {
                    table: "tasks".into(),
                    operation: Op::Insert,
                    data: json!({
                        "id": pk,
                        "title": format!("task created at {}", now),
                        "updated_at": now.as_millis(),
                    }),
                    old_data: serde_json::Value::Null,
                    lsn: None,
                    updated_at: now,
                    change_id: None,
                };
                let id = store.apply_local_change(&change)?;
                println!("queued local change {} ({})", id, pk);
            }
            'L' | 'l' => list_tasks(&store)?,
            'P' | 'p' => {
                let pending = store.list_pending_changes()?;
                if pending.is_empty() {
                    println!("nothing pending");
                }
                for record in pending {
                    println!(
                        "> {} {}/{} attempts={} error={}",
                        record.id,
                        record.table,
                        record.primary_key,
                        record.attempts,
                        record.error.as_deref().unwrap_or("-"),
                    );
                }
            }
            'R' | 'r' => {
                println!("revived {} records", store.retry_failed_changes()?);
            }
            'O' | 'o' => {
                let offline = !control.is_offline();
                control.set_offline(offline);
                println!("offline = {}", offline);
            }
            'Z' | 'z' => {
                store.reset_sync()?;
                println!("applied LSN reset; next session will run a full initial sync");
            }
            'D' | 'd' => {
                store.drop_local_state()?;
                println!("local state dropped");
            }
            'Q' | 'q' => {
                control.shutdown();
                break;
            }
            c => println!("unknown action '{}'", c),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"));
    let opts = Opts::from_args();
    if opts.serve {
        serve(opts.addr)
    } else {
        run_replica(&opts)
    }
}
