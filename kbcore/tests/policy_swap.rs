use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kbcore::*;
use kbcore::pm::{self, ca, fixed::FixedPolicy, random::RandomPolicy};
use rayon::prelude::*;

const PRESENT: CoreMask = 0xFF;
const DEBUG: CoreMask = 0x7F;
const SWAPS: usize = 200;
const POLLERS: usize = 6;
const POLLS: usize = 5_000;

/// A fixed policy that knows whether it is currently alive, and fails
/// loudly if it is asked anything outside its `init`..`term` window.
#[derive(Debug)]
struct Tracked {
    name:   &'static str,
    mask:   CoreMask,
    live:   AtomicBool,
    asked:  AtomicU64,
}

impl Tracked {
    const fn new(name: &'static str, mask: CoreMask) -> Self {
        Self {
            name,
            mask,
            live:   AtomicBool::new(false),
            asked:  AtomicU64::new(0),
        }
    }
}

impl CaPolicy for Tracked {
    fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> PolicyId {
        PolicyId::Fixed
    }

    fn init(&self, _dev: &Device) -> Result<PolicyData, PmError> {
        assert!(!in_atomic());
        // Make the construction window wide enough to be hit.
        std::thread::yield_now();
        assert!(!self.live.swap(true, Ordering::SeqCst), "{} initialized twice", self.name);
        Ok(PolicyData::Fixed)
    }

    fn term(&self, _dev: &Device, _data: PolicyData) {
        assert!(!in_atomic());
        assert!(self.live.swap(false, Ordering::SeqCst), "{} terminated while dead", self.name);
        std::thread::yield_now();
    }

    fn get_core_mask(&self, _data: &PolicyData, masks: &CoreMasks) -> CoreMask {
        assert!(in_atomic());
        assert!(self.live.load(Ordering::SeqCst), "{} asked while not live", self.name);
        self.asked.fetch_add(1, Ordering::Relaxed);
        masks.present & self.mask
    }

    fn update_core_status(&self, _: &mut PolicyData, _: &CoreMasks, _: CoreMask, _: CoreMask) {
        assert!(in_atomic());
        assert!(self.live.load(Ordering::SeqCst), "{} told while not live", self.name);
    }
}

fn device() -> Device {
    let dev = Device::new(DeviceConfig {
        shader_present:     PRESENT,
        debug_core_mask:    Some(DEBUG),
        ca_policy:          None,
    }).unwrap();
    ca::init(&dev).unwrap();
    dev
}

#[test]
fn readers_only_see_whole_policies() {
    static WIDE: Tracked = Tracked::new("tracked-0xf", 0xF);
    static NARROW: Tracked = Tracked::new("tracked-0x3", 0x3);

    let dev = device();
    ca::set_policy(&dev, &WIDE).unwrap();
    let allowed = [0xF & PRESENT & DEBUG, PRESENT & DEBUG, 0x3 & PRESENT & DEBUG];

    rayon::join(
        || {
            for i in 0..SWAPS {
                let next: &'static dyn CaPolicy = if i % 2 == 0 { &NARROW } else { &WIDE };
                ca::set_policy(&dev, next).unwrap();
            }
        },
        || {
            (0..POLLERS).into_par_iter().for_each(|p| {
                for n in 0..POLLS {
                    let mask = ca::get_core_mask(&dev);
                    assert!(allowed.contains(&mask), "unexpected core mask {:#x}", mask);
                    if let Some(policy) = ca::get_policy(&dev) {
                        assert!(["tracked-0xf", "tracked-0x3"].contains(&policy.name()));
                    }
                    // Half the pollers play the power-state interrupt.
                    if p % 2 == 0 && n % 16 == 0 {
                        pm::settle_cores(&dev);
                    }
                }
            });
        },
    );

    // Even number of swaps: back on WIDE.
    assert_eq!(ca::get_policy(&dev).map(|p| p.name()), Some("tracked-0xf"));
    assert_eq!(ca::get_core_mask(&dev), 0xF);
    assert!(WIDE.live.load(Ordering::SeqCst));
    assert!(!NARROW.live.load(Ordering::SeqCst));
    assert!(NARROW.asked.load(Ordering::Relaxed) > 0);
    assert!(dev.pm.can_suspend());
    assert!(!dev.pm.power_change().update_deferred());
    assert_eq!(dev.pm.power_change().desired_shader_state(), 0xF);

    ca::term(&dev);
    assert!(!WIDE.live.load(Ordering::SeqCst));
}

#[test]
fn fixed_to_fixed_swap_under_polling() {
    static F: FixedPolicy = FixedPolicy::new("fixed-0xf", 0xF);
    static THREE: FixedPolicy = FixedPolicy::new("fixed-0x3", 0x3);

    let dev = device();
    ca::set_policy(&dev, &F).unwrap();

    let observed = std::sync::Mutex::new(IndexMap::<CoreMask, usize>::new());
    rayon::join(
        || ca::set_policy(&dev, &THREE).unwrap(),
        || {
            (0..POLLERS).into_par_iter().for_each(|_| {
                let mut local = IndexMap::<CoreMask, usize>::new();
                for _ in 0..POLLS {
                    *local.entry(ca::get_core_mask(&dev)).or_default() += 1;
                }
                let mut all = observed.lock().unwrap();
                for (mask, hits) in local {
                    *all.entry(mask).or_default() += hits;
                }
            });
        },
    );

    let observed = observed.into_inner().unwrap();
    for mask in observed.keys() {
        assert!(
            [0xF & PRESENT & DEBUG, PRESENT & DEBUG, 0x3 & PRESENT & DEBUG].contains(mask),
            "unexpected core mask {:#x}",
            mask
        );
    }
    assert_eq!(ca::get_core_mask(&dev), 0x3);
}

#[test]
fn random_policy_survives_a_busy_interrupt_line() {
    static R: RandomPolicy = RandomPolicy::seeded("random-test", 42);

    let dev = device();
    ca::set_policy(&dev, &R).unwrap();
    rayon::join(
        || {
            for _ in 0..50 {
                ca::instr_enable(&dev);
                ca::instr_disable(&dev);
            }
        },
        || {
            (0..POLLERS).into_par_iter().for_each(|_| {
                for _ in 0..1_000 {
                    let ready = pm::settle_cores(&dev);
                    assert_eq!(ready & !(PRESENT & DEBUG), 0);
                    let mask = ca::get_core_mask(&dev);
                    assert_eq!(mask & !(PRESENT & DEBUG), 0);
                }
            });
        },
    );
    assert!(!dev.pm.power_change().masks().instr_enabled);
}
