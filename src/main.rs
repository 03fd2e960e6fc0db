use std::net::TcpListener;

use anyhow::{Context, Result};
use log::info;

use tinyredis::args::parse_flag;
use tinyredis::master::{self, MasterServer};
use tinyredis::net::{Binding, DEFAULT_PORT};
use tinyredis::redis::RedisServer;
use tinyredis::replica;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let port = parse_flag::<u16>(&args, "--port")
        .context("invalid --port")?
        .unwrap_or(DEFAULT_PORT);
    let replica_of = parse_flag::<Binding>(&args, "--replicaof")
        .map_err(|err| anyhow::anyhow!("invalid --replicaof: {}", err))?;

    let binding = Binding::local(port);
    let listener = TcpListener::bind(binding.to_string())
        .with_context(|| format!("failed to bind {}", binding))?;

    let redis = RedisServer::new(binding, replica_of.is_none());
    match replica_of {
        Some(leader) => {
            info!("starting as replica of {}", leader);
            replica::start_replication(redis.clone(), leader)?;
            replica::serve(listener, redis)
        }
        None => {
            info!("starting as master");
            master::serve(listener, MasterServer::new(redis))
        }
    }
}
