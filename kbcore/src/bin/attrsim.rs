use kbcore::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Drives the context attribute tracker with random scheduling events
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Contexts alive at any time
    #[arg(short, long, default_value_t = 8)]
    contexts:   u32,

    /// Number of events to simulate
    #[arg(short, long, default_value_t = 100_000)]
    events:     usize,

    /// Seed for the event stream
    #[arg(short, long, default_value_t = 0)]
    seed:       u64,
}

const REQS: [CoreReq; 5] = [
    CoreReq::FS,
    CoreReq::T,
    CoreReq::CS,
    CoreReq(CoreReq::CS.0 | CoreReq::COHERENT_GROUP.0),
    CoreReq(CoreReq::FS.0 | CoreReq::NSS.0),
];

fn random_flags(rng: &mut StdRng) -> CtxCreateFlags {
    CtxCreateFlags {
        submit_disabled:    rng.gen_bool(0.1),
        hint_only_compute:  rng.gen_bool(0.5),
    }
}

/// Scheduled contexts with the attribute on must match the run-pool count.
fn check(dev: &Device, live: &IndexMap<u32, (Context, Vec<Atom>)>) -> anyhow::Result<()> {
    for attr in Attribute::ALL {
        let holders = live
            .values()
            .filter(|(ctx, _)| {
                let info = ctx.sched_info();
                info.is_scheduled() && info.attrs().count(attr) > 0
            })
            .count() as RefCount;
        let count = dev.runpool_attr_count(attr);
        if count != holders {
            anyhow::bail!("{:?}: run-pool count {} but {} holders", attr, count, holders);
        }
    }

    Ok(())
}

/// Removes every atom and takes the context out of the run-pool.
fn retire(dev: &Device, ctx: Context, atoms: Vec<Atom>) -> usize {
    let mut triggers = 0;
    for mut atom in atoms {
        triggers += dev.remove_atom(&ctx, &mut atom) as usize;
    }
    if ctx.sched_info().is_scheduled() {
        triggers += dev.schedule_out(&ctx) as usize;
    }

    triggers
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    anyhow::ensure!(cli.contexts > 0, "Need at least one context");

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let dev = Device::new(DeviceConfig::default())?;
    let mut next_id = 0;
    let mut live: IndexMap<u32, (Context, Vec<Atom>)> = IndexMap::new();
    while live.len() < cli.contexts as usize {
        live.insert(next_id, (dev.create_context(next_id, random_flags(&mut rng)), vec![]));
        next_id += 1;
    }

    // Times the scheduler was told it may admit more work.
    let mut triggers = 0;
    for _ in 0..cli.events {
        let idx = rng.gen_range(0..live.len());
        match rng.gen_range(0..10) {
            0..=2 => {
                let (_, (ctx, _)) = live.get_index(idx).unwrap();
                if ctx.sched_info().is_scheduled() {
                    triggers += dev.schedule_out(ctx) as usize;
                } else {
                    dev.schedule_in(ctx);
                }
            },
            3..=5 => {
                let (_, (ctx, atoms)) = live.get_index_mut(idx).unwrap();
                let mut atom = Atom::new(REQS[rng.gen_range(0..REQS.len())]);
                dev.add_atom(ctx, &mut atom);
                atoms.push(atom);
            },
            6..=8 => {
                let (_, (ctx, atoms)) = live.get_index_mut(idx).unwrap();
                if !atoms.is_empty() {
                    let mut atom = atoms.swap_remove(rng.gen_range(0..atoms.len()));
                    triggers += dev.remove_atom(ctx, &mut atom) as usize;
                }
            },
            _ => {
                // Destroy a context and create a fresh one in its place.
                let (_, (ctx, atoms)) = live.swap_remove_index(idx).unwrap();
                triggers += retire(&dev, ctx, atoms);
                live.insert(next_id, (dev.create_context(next_id, random_flags(&mut rng)), vec![]));
                next_id += 1;
            },
        }
        check(&dev, &live)?;
    }

    println!("Events:\t\t{}\nContexts made:\t{}\nResubmissions:\t{}", cli.events, next_id, triggers);
    for attr in Attribute::ALL {
        println!("{:>16}:\t{}", format!("{:?}", attr), dev.runpool_attr_count(attr));
    }

    for (_, (ctx, atoms)) in live.drain(..) {
        triggers += retire(&dev, ctx, atoms);
    }
    let leftover = Attribute::ALL
        .iter()
        .filter(|a| dev.is_attr_on_runpool(**a))
        .collect_vec();
    anyhow::ensure!(leftover.is_empty(), "Attributes left on after teardown: {:?}", leftover);
    println!("Teardown clean ({} resubmissions in total).", triggers);

    Ok(())
}
