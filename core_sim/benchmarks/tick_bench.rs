use core_sim::{
    resolve_tick, Entity, GridPos, PlayerDirectory, RobotDefaults, Spawn, Token, WorldSnapshot,
    WorldState,
};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use sim_runtime::StagedCommand;

const COMMANDS_PER_PLAYER: usize = 8;

fn populated(players: u32) -> (WorldState, PlayerDirectory) {
    let mut world = WorldState::from_snapshot(
        WorldSnapshot {
            tick: 0,
            width: players,
            height: 1,
            cells: (0..players)
                .map(|x| {
                    (
                        GridPos::new(x, 0),
                        Entity::Spawn(Spawn {
                            cooldown_until: 0,
                            cooldown_amount: 10,
                            energy_required: 50,
                        }),
                    )
                })
                .collect(),
        },
        Some(7),
    );
    let mut directory = PlayerDirectory::new();
    let robot = RobotDefaults::default();
    for i in 0..players {
        let token = Token::from(format!("player-{i:04}"));
        directory
            .register(token.clone(), "bench", &mut world, &robot)
            .expect("bench world has a spawn per player");
        for n in 0..COMMANDS_PER_PLAYER {
            let command = StagedCommand::new("MOVE", vec![n.to_string(), "1".to_string()]);
            directory
                .stage(token.as_str(), command)
                .expect("player just registered");
        }
        directory.commit(token.as_str()).expect("player just registered");
    }
    (world, directory)
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for players in [1u32, 16, 64, 256] {
        group.bench_with_input(
            BenchmarkId::new("players", players),
            &players,
            |b, &players| {
                b.iter_batched(
                    || populated(players),
                    |(mut world, mut directory)| resolve_tick(&mut world, &mut directory),
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(tick_benches, bench_tick);
criterion_main!(tick_benches);
