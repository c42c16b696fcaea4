use std::env;
use std::io::BufRead;
use std::process;

use game_shard::config::WorldConfig;
use game_shard::server::ShardServer;
use game_shard::world::{spawn_game_loop, TickSource, World};

fn main() {
    let mut args = env::args().skip(1);
    let state_dir = args.next();

    let mut config = match WorldConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            process::exit(1);
        }
    };
    if let Some(dir) = state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(addr) = &config.log_store_addr {
        eprintln!("durable log endpoint configured: {addr} (state persists to the local state dir)");
    }
    let tick_interval = config.tick_interval;

    let mut world = match World::new(config) {
        Ok(world) => world,
        Err(err) => {
            eprintln!("failed to create world: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = world.load_game_state() {
        eprintln!("failed to load game state: {err}");
        process::exit(1);
    }

    let handle = world.handle();
    let mut server = match ShardServer::spawn(handle) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("failed to start server: {err}");
            process::exit(1);
        }
    };
    let game_loop = spawn_game_loop(world, TickSource::Interval(tick_interval));

    // Block until stdin closes (or an explicit quit), then drain gracefully:
    // the loop finishes any in-progress tick before exiting.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim() == "quit" => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    server.shutdown();
    if let Err(err) = game_loop.shutdown() {
        eprintln!("game loop shutdown failed: {err}");
        process::exit(1);
    }
}
