mod config;
mod level;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use tether::net::server::{Server, ServerMode};
use tether::net::NET_TICK_RATE;
use tether::World;

use config::ServerConfig;
use level::LevelFile;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Tether dedicated server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 3494)]
    port: u16,

    #[arg(short, long, default_value_t = 1)]
    expected_clients: usize,

    #[arg(short, long, default_value = "build/lvl/arena.lvl")]
    level: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        expected_clients: args.expected_clients,
        level_path: args.level,
    };

    let level = LevelFile::load(std::path::Path::new(&config.level_path))
        .with_context(|| format!("cannot load level {}", config.level_path))?;

    let mut world = World::new();
    level.spawn_into(&mut world);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("invalid bind address")?;
    let mut server = Server::bind(addr, config.expected_clients, level.descriptor())?;

    log::info!(
        "server on {} | level {} | {} entities | waiting for {} client(s)",
        server.local_addr()?,
        config.level_path,
        world.entity_count(),
        config.expected_clients
    );

    run(&mut server, &mut world);
    Ok(())
}

/// The update loop, pinned to the network tick rate: drain packets and
/// inbound messages, advance gameplay timers, consolidate and send.
fn run(server: &mut Server, world: &mut World) {
    let tick = Duration::from_secs_f32(NET_TICK_RATE);
    let mut last = Instant::now();
    let mut was_active = false;

    loop {
        let now = Instant::now();
        let dt = (now - last).as_secs_f32();
        last = now;

        server.update_start(world, dt);

        if server.mode() == ServerMode::Active {
            if !was_active {
                log::info!("session active with {} client(s)", server.connected_clients());
                was_active = true;
            }
            gameplay_tick(world, NET_TICK_RATE);
        }

        server.update_end(world, dt);

        // sleep out the remainder so the tick lands exactly on the rate
        let elapsed = last.elapsed();
        if elapsed < tick {
            std::thread::sleep(tick - elapsed);
        }
    }
}

/// Minimal authoritative simulation: run down the timers the snapshot codec
/// replicates. Ability and movement logic live in the gameplay layer.
fn gameplay_tick(world: &mut World, dt: f32) {
    for (_slot, _entity, drone) in world.drones.iter_mut() {
        drone.cooldown = (drone.cooldown - dt).max(0.0);
    }
    for (_slot, _entity, minion) in world.minions.iter_mut() {
        minion.attack_timer = (minion.attack_timer - dt).max(0.0);
        minion.animation_time += dt;
    }
    for (_slot, _entity, manager) in world.player_managers.iter_mut() {
        manager.spawn_timer = (manager.spawn_timer - dt).max(0.0);
        manager.state_timer = (manager.state_timer - dt).max(0.0);
    }
    for (_slot, _entity, health) in world.healths.iter_mut() {
        if health.regen_timer > 0.0 {
            health.regen_timer = (health.regen_timer - dt).max(0.0);
            if health.regen_timer == 0.0 && health.shield < health.shield_max {
                health.shield += 1;
            }
        }
    }
}
