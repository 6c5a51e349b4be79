use std::time::Instant;

use kbcore::*;
use kbcore::pm::{ca, fixed::FixedPolicy, settle_cores};
use rayon::prelude::*;

/// Inspects and exercises core-availability policies
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Shader cores present (hex with 0x, or decimal)
    #[arg(short, long, default_value = "0xF", value_parser = parse_mask)]
    present:    CoreMask,

    /// Debug core mask; all present cores if omitted
    #[arg(short, long, value_parser = parse_mask)]
    debug_mask: Option<CoreMask>,

    /// Policy to start with
    #[arg(long)]
    policy:     Option<String>,

    #[command(subcommand)]
    cmd:        Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List available policies, the active one in brackets
    List,
    /// Switch to a policy and report the cores it offers
    Set {
        name: String,
    },
    /// Swap between two fixed policies while pollers read the core mask
    Stress {
        /// Mask of the first fixed policy
        #[arg(value_parser = parse_mask)]
        from:       CoreMask,

        /// Mask of the second fixed policy
        #[arg(value_parser = parse_mask)]
        to:         CoreMask,

        /// Number of policy swaps
        #[arg(short, long, default_value_t = 100)]
        swaps:      usize,

        /// Number of concurrent pollers
        #[arg(short = 'j', long, default_value_t = 4)]
        pollers:    usize,

        /// Core mask reads per poller
        #[arg(short = 'n', long, default_value_t = 10_000)]
        polls:      usize,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    let dev = Device::new(DeviceConfig {
        shader_present:     cli.present,
        debug_core_mask:    cli.debug_mask,
        ca_policy:          cli.policy,
    })?;
    ca::init(&dev)?;

    match cli.cmd {
        Cmd::List => {
            println!("{}", ca::format_policies(&dev));
        },
        Cmd::Set { name } => {
            ca::set_policy_by_name(&dev, &name)?;
            println!("{}", ca::format_policies(&dev));
            println!("Core mask:\t{:#x}", ca::get_core_mask(&dev));
        },
        Cmd::Stress { from, to, swaps, pollers, polls } => {
            stress(&dev, from, to, swaps, pollers, polls)?;
        },
    }

    ca::term(&dev);
    Ok(())
}

fn stress(
    dev:        &Device,
    from:       CoreMask,
    to:         CoreMask,
    swaps:      usize,
    pollers:    usize,
    polls:      usize,
) -> anyhow::Result<()> {
    // Policies must outlive the device's slot; this process is short-lived.
    let first: &'static dyn CaPolicy = Box::leak(Box::new(FixedPolicy::new("stress-from", from)));
    let second: &'static dyn CaPolicy = Box::leak(Box::new(FixedPolicy::new("stress-to", to)));
    ca::set_policy(dev, first)?;

    let permissive = dev.pm.power_change().masks().permissive();
    let allowed = [from & permissive, permissive, to & permissive];
    let observed = Mutex::new(IndexMap::<CoreMask, usize>::new());

    let start = Instant::now();
    let (swapped, ()) = rayon::join(
        || -> Result<(), PmError> {
            for i in 0..swaps {
                ca::set_policy(dev, if i % 2 == 0 { second } else { first })?;
            }
            Ok(())
        },
        || {
            (0..pollers).into_par_iter().for_each(|p| {
                let mut local: IndexMap<CoreMask, usize> = IndexMap::new();
                for n in 0..polls {
                    *local.entry(ca::get_core_mask(dev)).or_default() += 1;
                    // Every other poller stands in for the power IRQ.
                    if p % 2 == 1 && n % 64 == 0 {
                        settle_cores(dev);
                    }
                }
                let mut all = observed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for (mask, hits) in local {
                    *all.entry(mask).or_default() += hits;
                }
            });
        },
    );
    swapped?;
    println!("{} swaps, {} reads in {} μs", swaps, pollers * polls, start.elapsed().as_micros());

    let observed = observed
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    let mut unexpected = 0;
    for (mask, hits) in &observed {
        let what = if *mask == allowed[0] {
            "first policy"
        } else if *mask == allowed[2] {
            "second policy"
        } else if *mask == allowed[1] {
            "mid-swap default"
        } else {
            unexpected += 1;
            "UNEXPECTED"
        };
        println!("{:#18x}\t{:>10} reads\t{}", mask, hits, what);
    }
    if unexpected > 0 {
        anyhow::bail!("{} unexpected core masks observed", unexpected);
    }

    Ok(())
}
